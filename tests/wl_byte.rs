mod common;

mod wear_leveling_byte {
    use crate::common;
    use crate::common::{Eeprom, Operation, TestElement};
    use pretty_assertions::assert_eq;
    use supla_storage::error::Error;
    use supla_storage::platform::EepromMedium;
    use supla_storage::raw::{StateEntryAddress, StateWlByteHeader};
    use supla_storage::{Storage, StorageConfig, WearLevelingMode};

    const AVAILABLE_SIZE: u32 = 100;
    const MAIN_ENTRY: usize = 15;
    const BACKUP_ENTRY: usize = 23;
    const FIRST_SLOT: u32 = 31;
    // header + one i32
    const SLOT_SIZE: u32 = 8;
    const SLOT_COUNT: u32 = 8;

    fn config(available_size: u32) -> StorageConfig {
        StorageConfig::default()
            .with_wear_leveling(WearLevelingMode::ByteWriteMode)
            .with_available_size(available_size)
    }

    fn boot(eeprom: Eeprom) -> Storage<EepromMedium<Eeprom>> {
        let mut storage = Storage::new(EepromMedium::new(eeprom), config(AVAILABLE_SIZE));
        storage.init().unwrap();
        storage
    }

    fn reboot(storage: Storage<EepromMedium<Eeprom>>) -> Storage<EepromMedium<Eeprom>> {
        let mut eeprom = storage.into_medium().into_inner();
        eeprom.disable_faults();
        boot(eeprom)
    }

    fn load(storage: &mut Storage<EepromMedium<Eeprom>>) -> Result<i32, Error> {
        let mut element = TestElement::new(0);
        storage.load_state_storage(&mut [&mut element])?;
        Ok(element.value)
    }

    fn entry(eeprom: &Eeprom, offset: usize) -> StateEntryAddress {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&eeprom.buf[offset..offset + 8]);
        StateEntryAddress::from_bytes(&buf)
    }

    #[test]
    fn fresh_init_writes_metadata() {
        let storage = boot(Eeprom::new(128));

        let eeprom = storage.into_medium().into_inner();
        assert_eq!(&eeprom.buf[..8], b"SUPLA\x01\x00\x01");
        assert_eq!(&eeprom.buf[8..15], &[4, 92, 0, 0, 0, 0, 0]);

        let initial = StateEntryAddress::new(FIRST_SLOT, 0);
        assert_eq!(entry(&eeprom, MAIN_ENTRY), initial);
        assert_eq!(entry(&eeprom, BACKUP_ENTRY), initial);
        let header = StateWlByteHeader {
            write_count: 0,
            crc: 0,
        };
        assert_eq!(&eeprom.buf[31..35], &header.to_bytes());
    }

    #[test]
    fn nothing_to_load_after_fresh_init() {
        let storage = boot(Eeprom::new(128));

        let mut storage = reboot(storage);
        assert_eq!(load(&mut storage), Err(Error::NoValidState));
    }

    #[test]
    fn save_and_load() {
        let mut storage = boot(Eeprom::new(128));
        common::save(&mut storage, &[&TestElement::new(123456)]).unwrap();
        assert_eq!(load(&mut storage), Ok(123456));

        let mut storage = reboot(storage);
        assert_eq!(load(&mut storage), Ok(123456));

        let eeprom = storage.into_medium().into_inner();
        assert_eq!(
            entry(&eeprom, MAIN_ENTRY),
            StateEntryAddress::new(FIRST_SLOT, 4)
        );
        assert_eq!(entry(&eeprom, BACKUP_ENTRY), entry(&eeprom, MAIN_ENTRY));
    }

    #[test]
    fn survives_reboots_between_saves() {
        let mut storage = boot(Eeprom::new(128));

        for i in 0..1000 {
            common::save(&mut storage, &[&TestElement::new(i)]).unwrap();
            if i % 7 == 0 || i % 11 == 0 {
                storage = reboot(storage);
            }
            assert_eq!(load(&mut storage), Ok(i), "after save {i}");
        }
    }

    #[test]
    fn identical_saves_do_not_lose_the_state() {
        let mut storage = boot(Eeprom::new(128));

        for i in 0..200 {
            let value = i / 5;
            common::save(&mut storage, &[&TestElement::new(value)]).unwrap();
            if i % 3 == 0 {
                storage = reboot(storage);
            }
            assert_eq!(load(&mut storage), Ok(value), "after save {i}");
        }
    }

    #[test]
    fn header_writes_are_spread_over_all_slots() {
        let mut storage = boot(Eeprom::new(128));
        for i in 0..720 {
            common::save(&mut storage, &[&TestElement::new(i)]).unwrap();
        }

        let eeprom = storage.into_medium().into_inner();
        let writes: Vec<usize> = (0..SLOT_COUNT)
            .map(|slot| eeprom.writes_at(FIRST_SLOT + slot * SLOT_SIZE))
            .collect();
        let min = *writes.iter().min().unwrap();
        let max = *writes.iter().max().unwrap();
        assert!(min > 0, "{writes:?}");
        assert!(max <= 2 * min, "{writes:?}");
        // nothing beyond the last slot
        assert!(eeprom.operations.iter().all(|op| match op {
            Operation::Write { offset, len } => *offset as usize + len <= AVAILABLE_SIZE as usize,
            _ => true,
        }));
    }

    /// Saves until the next save moves the entry address to the second slot.
    fn fill_first_pair(storage: &mut Storage<EepromMedium<Eeprom>>) {
        // the first pair takes 9 saves, write counts 0 to 9
        for i in 0..10 {
            common::save(storage, &[&TestElement::new(i)]).unwrap();
        }
        assert_eq!(
            entry(storage.medium().get_ref(), MAIN_ENTRY),
            StateEntryAddress::new(FIRST_SLOT, 4)
        );
    }

    #[test]
    fn crash_before_main_entry_update() {
        let mut storage = boot(Eeprom::new(128));
        fill_first_pair(&mut storage);

        storage.medium_mut().get_mut().fail_on_write_to = Some(MAIN_ENTRY as u32);
        assert_eq!(
            common::save(&mut storage, &[&TestElement::new(100)]),
            Err(Error::MediumError)
        );

        let mut storage = reboot(storage);
        {
            let eeprom = storage.medium().get_ref();
            assert_eq!(
                entry(eeprom, BACKUP_ENTRY),
                StateEntryAddress::new(FIRST_SLOT + SLOT_SIZE, 4)
            );
            assert_eq!(
                entry(eeprom, MAIN_ENTRY),
                StateEntryAddress::new(FIRST_SLOT, 4)
            );
        }
        assert_eq!(load(&mut storage), Ok(100));

        for i in 101..140 {
            common::save(&mut storage, &[&TestElement::new(i)]).unwrap();
        }
        let mut storage = reboot(storage);
        assert_eq!(load(&mut storage), Ok(139));
    }

    #[test]
    fn crash_before_backup_entry_update() {
        let mut storage = boot(Eeprom::new(128));
        fill_first_pair(&mut storage);

        storage.medium_mut().get_mut().fail_on_write_to = Some(BACKUP_ENTRY as u32);
        assert_eq!(
            common::save(&mut storage, &[&TestElement::new(100)]),
            Err(Error::MediumError)
        );

        let mut storage = reboot(storage);
        assert_eq!(load(&mut storage), Ok(9));

        common::save(&mut storage, &[&TestElement::new(101)]).unwrap();
        let mut storage = reboot(storage);
        assert_eq!(load(&mut storage), Ok(101));
    }

    #[test]
    fn crash_during_payload_write_keeps_previous_state() {
        let mut storage = boot(Eeprom::new(128));
        common::save(&mut storage, &[&TestElement::new(1)]).unwrap();
        common::save(&mut storage, &[&TestElement::new(2)]).unwrap();

        // the third save goes to the first slot again
        storage.medium_mut().get_mut().fail_on_write_to = Some(FIRST_SLOT + 4);
        assert_eq!(
            common::save(&mut storage, &[&TestElement::new(3)]),
            Err(Error::MediumError)
        );

        let mut storage = reboot(storage);
        assert_eq!(load(&mut storage), Ok(2));
    }

    #[test]
    fn corrupted_main_entry_falls_back_to_backup() {
        let mut storage = boot(Eeprom::new(128));
        common::save(&mut storage, &[&TestElement::new(77)]).unwrap();

        let mut eeprom = storage.into_medium().into_inner();
        eeprom.buf[MAIN_ENTRY] ^= 0xff;

        let mut storage = boot(eeprom);
        assert_eq!(load(&mut storage), Ok(77));
    }

    #[test]
    fn size_change_starts_new_baseline() {
        let mut storage = boot(Eeprom::new(128));
        let a = TestElement::new(1);
        let b = TestElement::new(2);
        common::save(&mut storage, &[&a]).unwrap();

        let mut storage = reboot(storage);
        let modifications = storage.medium().get_ref().modifications();
        assert!(!storage.is_state_storage_valid(&[&a, &b]));
        assert_eq!(storage.medium().get_ref().modifications(), modifications);
        assert_eq!(load(&mut storage), Err(Error::NoValidState));

        storage.write_state_storage(&[&a, &b]).unwrap();
        let mut storage = reboot(storage);
        let mut loaded = [TestElement::new(0), TestElement::new(0)];
        let [x, y] = &mut loaded;
        storage.load_state_storage(&mut [x, y]).unwrap();
        assert_eq!(loaded, [a, b]);
    }

    #[test]
    fn region_too_small_for_three_slots() {
        let eeprom = Eeprom::new(128);
        let mut storage = Storage::new(EepromMedium::new(eeprom), config(48));
        storage.init().unwrap();

        let element = TestElement::new(1);
        assert!(!storage.is_state_storage_valid(&[&element]));
        assert_eq!(
            storage.write_state_storage(&[&element]),
            Err(Error::StateStorageDisabled)
        );
    }

    #[test]
    fn two_slots_of_twelve_bytes_are_refused() {
        // 52 byte section, 29 bytes behind the entry addresses
        let mut storage = Storage::new(EepromMedium::new(Eeprom::new(128)), config(60));
        storage.init().unwrap();

        let a = TestElement::new(1);
        let b = TestElement::new(2);
        assert!(!storage.is_state_storage_valid(&[&a, &b]));
        assert_eq!(
            storage.write_state_storage(&[&a, &b]),
            Err(Error::StateStorageDisabled)
        );

        // one more slot fits with 12 more bytes
        let mut storage = Storage::new(EepromMedium::new(Eeprom::new(128)), config(72));
        storage.init().unwrap();
        common::save(&mut storage, &[&a, &b]).unwrap();
    }

    #[test]
    fn region_too_small_for_metadata() {
        let eeprom = Eeprom::new(128);
        let mut storage = Storage::new(EepromMedium::new(eeprom), config(36));
        assert_eq!(storage.init(), Err(Error::InsufficientSpace));
        assert!(storage.is_initialized());
        assert_eq!(
            storage.write_state_storage(&[&TestElement::new(1)]),
            Err(Error::StateStorageDisabled)
        );
    }
}
