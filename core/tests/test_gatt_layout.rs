//! Handle numbering of compiled GATT tables

use blehost_core::att::{CharProps, Uuid};
use blehost_core::gatt::{attribute_count, cccd_handle, value_handle, CharDef, GattServer, ServiceDef};
use proptest::prelude::*;

const BATTERY: Uuid = Uuid::from16(0x180F);
const LEVEL: Uuid = Uuid::from16(0x2A19);
const UART: Uuid = Uuid::from128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
const UART_TX: Uuid = Uuid::from128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

const BATTERY_CHARS: &[CharDef] = &[CharDef::new(LEVEL, CharProps::READ)];
const UART_CHARS: &[CharDef] = &[CharDef::new(UART_TX, CharProps::INDICATE)];
const SERVICES: &[ServiceDef] = &[
    ServiceDef::new(BATTERY, BATTERY_CHARS),
    ServiceDef::new(UART, UART_CHARS),
];

// Resolved at compile time
const ATTRS: usize = attribute_count(SERVICES);
const UART_TX_VALUE: Option<u16> = value_handle(SERVICES, &UART, &UART_TX);

#[test]
fn test_const_layout() {
    assert_eq!(ATTRS, 7);
    assert_eq!(value_handle(SERVICES, &BATTERY, &LEVEL), Some(3));
    assert_eq!(cccd_handle(SERVICES, &BATTERY, &LEVEL), None);
    assert_eq!(UART_TX_VALUE, Some(6));
    assert_eq!(cccd_handle(SERVICES, &UART, &UART_TX), Some(7));
}

#[test]
fn test_width_sensitive_lookup() {
    // 0x2A19 expanded onto the Bluetooth base UUID
    let expanded = Uuid::from128(0x00002a19_0000_1000_8000_00805f9b34fb);
    assert_eq!(value_handle(SERVICES, &BATTERY, &expanded), None);
}

#[test]
fn test_declaration_values() {
    let server = GattServer::<ATTRS>::new(SERVICES).expect("Server builds");
    let attrs: Vec<_> = server.database().iter().collect();
    assert_eq!(attrs.len(), ATTRS);
    assert_eq!(attrs[0].value(), &[0x0F, 0x18]);
    // properties, value handle, UUID
    assert_eq!(attrs[1].value(), &[0x02, 0x03, 0x00, 0x19, 0x2A]);
    assert_eq!(attrs[3].value().len(), 16);
    assert_eq!(&attrs[4].value()[..3], &[0x20, 0x06, 0x00]);
    for (i, attr) in attrs.iter().enumerate() {
        assert_eq!(attr.handle as usize, i + 1);
    }
}

fn props() -> impl Strategy<Value = CharProps> {
    any::<u8>().prop_map(CharProps::from_bits_truncate)
}

proptest! {
    #[test]
    fn test_numbering_rule(table in proptest::collection::vec(
        proptest::collection::vec(props(), 0..5),
        1..5,
    )) {
        let char_defs: Vec<Vec<CharDef>> = table
            .iter()
            .enumerate()
            .map(|(s, chars)| {
                chars
                    .iter()
                    .enumerate()
                    .map(|(c, p)| CharDef::new(Uuid::from16(0x2A00 + (s * 16 + c) as u16), *p))
                    .collect()
            })
            .collect();
        let services: Vec<ServiceDef> = char_defs
            .iter()
            .enumerate()
            .map(|(s, chars)| ServiceDef::new(Uuid::from16(0x1800 + s as u16), chars))
            .collect();

        let server = GattServer::<128>::new(&services).expect("Server builds");
        prop_assert_eq!(server.database().len(), attribute_count(&services));

        // Service declaration, then per characteristic: declaration, value and
        // a CCCD when it can notify or indicate
        let mut next = 1u16;
        for service in &services {
            next += 1;
            for chr in service.characteristics {
                let value = next + 1;
                let cccd = chr.props.intersects(CharProps::NOTIFY | CharProps::INDICATE);
                prop_assert_eq!(value_handle(&services, &service.uuid, &chr.uuid), Some(value));
                prop_assert_eq!(server.value_handle(&service.uuid, &chr.uuid), Some(value));
                let expected_cccd = cccd.then_some(value + 1);
                prop_assert_eq!(cccd_handle(&services, &service.uuid, &chr.uuid), expected_cccd);
                prop_assert_eq!(server.cccd_handle(&service.uuid, &chr.uuid), expected_cccd);
                next += if cccd { 3 } else { 2 };
            }
        }
        prop_assert_eq!(next as usize - 1, attribute_count(&services));
    }
}
