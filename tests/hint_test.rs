//! Tests for hints, hint sets and hint-routed decoding.

use blockproc_rs::types::{
    crypto_primitives::ValueHash,
    hint::{Hint, HintError, HintSet, HintType},
    operation::{decode_operation, Operation},
};
use log::LevelFilter;

mod common;

use crate::common::{
    kv_operation::{kv_decoders, KvOperation, KV_OPERATION_HINT},
    logging::setup_logger,
};

const TYPE: HintType = HintType::new([0xff, 0x01]);

#[test]
fn compatibility_test() {
    setup_logger(LevelFilter::Trace);

    let target = Hint::new(TYPE, 1, 2, 3);

    assert!(Hint::new(TYPE, 1, 2, 3).is_compatible(&target));
    assert!(Hint::new(TYPE, 1, 0, 9).is_compatible(&target));
    assert!(Hint::new(TYPE, 1, 2, 0).is_compatible(&target));
    assert!(!Hint::new(TYPE, 1, 2, 4).is_compatible(&target));
    assert!(!Hint::new(TYPE, 1, 3, 0).is_compatible(&target));
    assert!(!Hint::new(TYPE, 0, 2, 3).is_compatible(&target));
    assert!(!Hint::new(TYPE, 2, 0, 0).is_compatible(&target));
    assert!(!Hint::new(HintType::new([0xff, 0x02]), 1, 2, 3).is_compatible(&target));
}

#[test]
fn string_form_test() {
    setup_logger(LevelFilter::Trace);

    let hint = Hint::new(TYPE, 0, 1, 2);
    assert_eq!(hint.to_string(), "ff01+v0.1.2");
    assert_eq!("ff01+v0.1.2".parse::<Hint>().unwrap(), hint);

    assert!(matches!("ff01-0.1.2".parse::<Hint>(), Err(HintError::InvalidFormat(_))));
    assert!(matches!("zz01+v0.1.2".parse::<Hint>(), Err(HintError::InvalidType(_))));
    assert!(matches!("ff01+vx.y".parse::<Hint>(), Err(HintError::InvalidVersion(_))));

    let json = serde_json::to_value(&hint).unwrap();
    assert_eq!(json, serde_json::json!({"type": "ff01", "version": "0.1.2"}));
    assert_eq!(serde_json::from_value::<Hint>(json).unwrap(), hint);
}

#[test]
fn hint_set_test() {
    setup_logger(LevelFilter::Trace);

    let mut set = HintSet::new();
    set.add(Hint::new(TYPE, 1, 0, 0), "v1.0.0").unwrap();
    set.add(Hint::new(TYPE, 1, 4, 0), "v1.4.0").unwrap();
    set.add(Hint::new(TYPE, 2, 0, 0), "v2.0.0").unwrap();
    assert_eq!(set.len(), 3);

    assert!(matches!(
        set.add(Hint::new(TYPE, 1, 4, 0), "again"),
        Err(HintError::Duplicated(_))
    ));

    // The highest compatible version wins.
    assert_eq!(set.compatible(&Hint::new(TYPE, 1, 0, 0)), Some(&"v1.4.0"));
    assert_eq!(set.compatible(&Hint::new(TYPE, 1, 3, 9)), Some(&"v1.4.0"));
    assert_eq!(set.compatible(&Hint::new(TYPE, 2, 0, 0)), Some(&"v2.0.0"));
    assert_eq!(set.compatible(&Hint::new(TYPE, 1, 5, 0)), None);
    assert_eq!(set.compatible(&Hint::new(TYPE, 3, 0, 0)), None);

    let (registered, _) = set.compatible_entry(&Hint::new(TYPE, 1, 0, 1)).unwrap();
    assert_eq!(registered, &Hint::new(TYPE, 1, 4, 0));
}

#[test]
fn value_hash_test() {
    setup_logger(LevelFilter::Trace);

    let hash = ValueHash::sha256(&[b"a".as_slice(), b"b".as_slice()]);
    assert_eq!(hash, ValueHash::sha256(&[b"ab".as_slice()]));
    assert_eq!(hash.hint(), &ValueHash::SHA256_HINT);
    assert_eq!(hash.bytes().len(), 32);

    // Equal bytes under a different hint are a different hash.
    let other = ValueHash::new(Hint::new(TYPE, 0, 0, 1), hash.bytes().to_vec());
    assert_ne!(hash, other);

    let json = serde_json::to_value(&hash).unwrap();
    assert_eq!(json["hash"], hex::encode(hash.bytes()));
    assert_eq!(serde_json::from_value::<ValueHash>(json).unwrap(), hash);
}

#[test]
fn decode_operation_test() {
    setup_logger(LevelFilter::Trace);

    let decoders = kv_decoders();
    let operation = KvOperation::set("a", b"1");
    let record = serde_json::to_value(&operation).unwrap();

    // 1. A record is routed to the decoder of its hint.
    let decoded = decode_operation(&decoders, record.clone()).unwrap();
    assert_eq!(decoded.hint(), &KV_OPERATION_HINT);
    assert_eq!(decoded.fact_hash(), operation.fact_hash());

    // 2. Records without a known hint are rejected.
    let mut unknown = record.clone();
    unknown["_hint"] = serde_json::to_value(Hint::new(TYPE, 0, 0, 1)).unwrap();
    assert!(decode_operation(&decoders, unknown).is_err());

    let mut missing = record;
    missing.as_object_mut().unwrap().remove("_hint");
    assert!(decode_operation(&decoders, missing).is_err());
}
