use anyhow::Result;
use tempfile::tempdir;

use esimkit_core::{
    config::EsimConfig,
    error::ErrorKind,
    inventory::InventoryStore,
    lpa,
    util,
};

#[test]
fn corrupt_db_is_storage_error() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("corrupt.db");
    std::fs::write(&db_path, b"not-a-sqlite-db, just some bytes that are long enough")?;

    let err = InventoryStore::open(&db_path).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);
    Ok(())
}

#[test]
fn invalid_input_never_reaches_storage() -> Result<()> {
    let store = InventoryStore::open_in_memory()?;
    for (raw, kind) in [
        ("", ErrorKind::Format),
        ("rsp.truphone.com", ErrorKind::Format),
        ("LPA:1$rsp.truphone.com$A$B", ErrorKind::Format),
        ("LPA:1$bad host.com$A", ErrorKind::Validation),
        ("LPA:1$abc$A", ErrorKind::Validation),
    ] {
        let err = store.add_from_raw(raw, "").unwrap_err();
        assert_eq!(err.kind(), kind, "input {raw:?}");
    }
    assert!(store
        .add_server("rsp.truphone.com", Some("A$B"), "")
        .is_err());
    assert_eq!(store.stats()?.total, 0);
    Ok(())
}

#[test]
fn reasons_are_displayable_without_kind() {
    let err = lpa::parse("LPA:1$rsp.truphone.com").unwrap_err();
    assert!(err.to_string().starts_with("format: "));
    assert!(!err.reason().starts_with("format"));

    let err = util::validate_iccid("89445001021983048x6").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.reason().contains("digits"));
}

#[test]
fn malformed_config_is_config_error() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("esimkit.toml");
    std::fs::write(&path, "[api\nbase_url = ")?;
    let err = EsimConfig::load_from(&path).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);

    std::fs::write(&path, "[api]\nauth_timeout_secs = 0\n")?;
    let cfg = EsimConfig::load_from(&path)?;
    assert_eq!(cfg.validate().unwrap_err().kind(), ErrorKind::Config);
    Ok(())
}
