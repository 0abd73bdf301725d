use anyhow::Result;
use tempfile::tempdir;

use veritag_core::{
    config::Limits,
    error::VeritagError,
    identity::Identity,
    item::derive_identifier,
    registry::Registry,
};

fn id(byte: u8) -> Identity {
    Identity::from_bytes([byte; 20])
}

fn setup(dir: &tempfile::TempDir) -> Registry {
    let db_path = dir.path().join("registry.db");
    Registry::create_new(&db_path, id(0xA0), Limits::default()).unwrap()
}

#[test]
fn corrupt_db_rejected() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("corrupt.db");
    std::fs::write(&db_path, b"not-a-sqlite-db")?;

    let err = Registry::open_existing(&db_path, Limits::default()).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("database") || msg.contains("store"));
    Ok(())
}

#[test]
fn non_admin_cannot_manage_issuers() {
    let dir = tempdir().unwrap();
    let mut registry = setup(&dir);
    let intruder = id(0x66);

    let err = registry
        .authorize_issuer(intruder, id(0x01), true)
        .unwrap_err();
    assert!(matches!(err, VeritagError::Unauthorized(_)));

    let err = registry.transfer_ownership(intruder, id(0x02)).unwrap_err();
    assert!(matches!(err, VeritagError::Unauthorized(_)));

    let err = registry.pause(intruder).unwrap_err();
    assert!(matches!(err, VeritagError::Unauthorized(_)));
}

#[test]
fn zero_identity_rejected() {
    let dir = tempdir().unwrap();
    let mut registry = setup(&dir);
    let admin = id(0xA0);

    let err = registry
        .authorize_issuer(admin, Identity::ZERO, true)
        .unwrap_err();
    assert!(matches!(err, VeritagError::InvalidInput(_)));

    let err = registry
        .transfer_ownership(admin, Identity::ZERO)
        .unwrap_err();
    assert!(matches!(err, VeritagError::InvalidInput(_)));

    // Transferring to the current administrator is also malformed input.
    let err = registry.transfer_ownership(admin, admin).unwrap_err();
    assert!(matches!(err, VeritagError::InvalidInput(_)));
}

#[test]
fn non_issuer_cannot_register() {
    let dir = tempdir().unwrap();
    let mut registry = setup(&dir);
    let outsider = id(0x55);
    let item = derive_identifier(1, "SN001");

    let err = registry
        .register_batch(outsider, 1, "Bag", "Acme", &[item], None)
        .unwrap_err();
    assert!(matches!(err, VeritagError::Unauthorized(_)));
}

#[test]
fn register_input_validation() {
    let dir = tempdir().unwrap();
    let mut registry = setup(&dir);
    let admin = id(0xA0);
    let item = derive_identifier(1, "SN001");

    for (batch_id, name, brand, items) in [
        (0u64, "Bag", "Acme", vec![item]),
        (1, "", "Acme", vec![item]),
        (1, "   ", "Acme", vec![item]),
        (1, "Bag", "", vec![item]),
        (1, "Bag", "Acme", vec![]),
    ] {
        let err = registry
            .register_batch(admin, batch_id, name, brand, &items, None)
            .unwrap_err();
        assert!(matches!(err, VeritagError::InvalidInput(_)), "{batch_id} {name:?} {brand:?}");
    }
}

#[test]
fn register_identifier_cap_enforced() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("registry.db");
    let limits = Limits {
        max_batch_identifiers: 4,
        max_verify_items: 4,
    };
    let admin = id(0xA0);
    let mut registry = Registry::create_new(&db_path, admin, limits).unwrap();

    let items: Vec<_> = (0..5)
        .map(|i| derive_identifier(1, &format!("SN-{i}")))
        .collect();
    let err = registry
        .register_batch(admin, 1, "Bag", "Acme", &items, None)
        .unwrap_err();
    assert!(matches!(err, VeritagError::InvalidInput(_)));

    let err = registry
        .verify_batch(admin, &items, &[1, 1, 1, 1, 1])
        .unwrap_err();
    assert!(matches!(err, VeritagError::InvalidInput(_)));
}

#[test]
fn failed_register_is_atomic() -> Result<()> {
    let dir = tempdir()?;
    let mut registry = setup(&dir);
    let admin = id(0xA0);
    let events_before = registry.events()?.len();

    let err = registry
        .register_batch(admin, 3, "", "Acme", &[derive_identifier(3, "S")], None)
        .unwrap_err();
    assert!(matches!(err, VeritagError::InvalidInput(_)));

    // No batch record, no counter change, no event.
    assert!(!registry.get_batch(3)?.exists);
    assert_eq!(registry.statistics()?.total_products, 0);
    assert_eq!(registry.events()?.len(), events_before);
    Ok(())
}

#[test]
fn verify_error_taxonomy() {
    let dir = tempdir().unwrap();
    let mut registry = setup(&dir);
    let admin = id(0xA0);
    let item = derive_identifier(1, "SN001");
    registry
        .register_batch(admin, 1, "Bag", "Acme", &[item], None)
        .unwrap();

    let err = registry.verify(admin, item, 0).unwrap_err();
    assert!(matches!(err, VeritagError::InvalidInput(_)));

    let err = registry.verify(admin, item, 42).unwrap_err();
    assert!(matches!(err, VeritagError::NotFound(42)));

    let err = registry
        .verify_batch(admin, &[item, item], &[1])
        .unwrap_err();
    assert!(matches!(
        err,
        VeritagError::ArrayLengthMismatch { items: 2, batches: 1 }
    ));
}

#[test]
fn pause_gates_mutations_but_not_reads() -> Result<()> {
    let dir = tempdir()?;
    let mut registry = setup(&dir);
    let admin = id(0xA0);
    let item = derive_identifier(1, "SN001");
    registry.register_batch(admin, 1, "Bag", "Acme", &[item], None)?;

    registry.pause(admin)?;

    // Mutating paths all fail with SystemPaused.
    let err = registry
        .register_batch(admin, 2, "Hat", "Acme", &[item], None)
        .unwrap_err();
    assert!(matches!(err, VeritagError::SystemPaused));
    let err = registry.verify(admin, item, 1).unwrap_err();
    assert!(matches!(err, VeritagError::SystemPaused));
    let err = registry.verify_batch(admin, &[item], &[1]).unwrap_err();
    assert!(matches!(err, VeritagError::SystemPaused));
    let err = registry
        .update_metadata(admin, 1, Default::default())
        .unwrap_err();
    assert!(matches!(err, VeritagError::SystemPaused));

    // Reads and access control stay available.
    assert!(registry.get_batch(1)?.exists);
    assert_eq!(registry.statistics()?.total_products, 1);
    registry.authorize_issuer(admin, id(0x01), true)?;

    // Double pause is an invalid transition; unpause recovers.
    let err = registry.pause(admin).unwrap_err();
    assert!(matches!(err, VeritagError::InvalidState(_)));
    registry.unpause(admin)?;
    let err = registry.unpause(admin).unwrap_err();
    assert!(matches!(err, VeritagError::InvalidState(_)));

    assert!(registry.verify(admin, item, 1)?);
    Ok(())
}

#[test]
fn update_metadata_requires_existing_batch() {
    let dir = tempdir().unwrap();
    let mut registry = setup(&dir);
    let admin = id(0xA0);

    let err = registry
        .update_metadata(admin, 12, Default::default())
        .unwrap_err();
    assert!(matches!(err, VeritagError::NotFound(12)));
}
