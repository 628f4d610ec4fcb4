use anyhow::Result;
use shadow_core::directory::DeviceDirectory;
use shadow_core::AppError;

use crate::config::Config;
use crate::directory::StaticDirectory;
use crate::fixtures;

#[tokio::test]
async fn lookup_by_fingerprint_issues_a_token_usable_for_rechecks() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let directory = fixtures::setup_directory(&config, vec![fixtures::device("dev-1", "thermostat", b"fp-1")]);

    let device = directory.get_by_fingerprint(b"fp-1").await?;
    let rechecked = directory.get_by_token(&device.token).await?;

    assert_eq!(device.id, "dev-1");
    assert!(!device.token.is_empty(), "expected a token to be issued");
    assert_eq!(rechecked.id, "dev-1");
    Ok(())
}

#[tokio::test]
async fn unknown_fingerprint_is_not_found() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let directory = fixtures::setup_directory(&config, vec![fixtures::device("dev-1", "thermostat", b"fp-1")]);

    let err = directory.get_by_fingerprint(b"fp-2").await.unwrap_err();

    assert!(matches!(err.downcast_ref::<AppError>(), Some(AppError::ResourceNotFound)));
    Ok(())
}

#[tokio::test]
async fn tokens_are_rejected_when_foreign_or_device_removed() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let directory = fixtures::setup_directory(&config, vec![fixtures::device("dev-1", "thermostat", b"fp-1")]);
    let foreign = StaticDirectory::new(b"another-key", vec![fixtures::device("dev-1", "thermostat", b"fp-1")]);
    let foreign_token = foreign.get_by_fingerprint(b"fp-1").await?.token;
    let token = directory.get_by_fingerprint(b"fp-1").await?.token;

    let foreign_err = directory.get_by_token(&foreign_token).await.unwrap_err();
    directory.replace(vec![]);
    let removed_err = directory.get_by_token(&token).await.unwrap_err();

    assert!(matches!(foreign_err.downcast_ref::<AppError>(), Some(AppError::UnknownToken)));
    assert!(matches!(removed_err.downcast_ref::<AppError>(), Some(AppError::UnknownToken)));
    Ok(())
}

#[tokio::test]
async fn replace_exposes_updated_flags() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let directory = fixtures::setup_directory(&config, vec![fixtures::device("dev-1", "thermostat", b"fp-1")]);
    let token = directory.get_by_fingerprint(b"fp-1").await?.token;
    let (mut disabled, fingerprint) = fixtures::device("dev-1", "thermostat", b"fp-1");
    disabled.enabled = false;

    directory.replace(vec![(disabled, fingerprint)]);

    assert!(!directory.get_by_token(&token).await?.enabled);
    Ok(())
}

#[tokio::test]
async fn from_file_decodes_base64_fingerprints() -> Result<()> {
    let (config, tmpdir) = Config::new_test()?;
    let path = tmpdir.path().join("devices.json");
    let registry = serde_json::json!([
        {"id": "dev-1", "title": "thermostat", "enabled": true, "basic_enabled": true, "tags": {"room": "kitchen"}, "fingerprint": base64::encode(b"fp-1")},
        {"id": "dev-2", "title": "sensor", "fingerprint": base64::encode(b"fp-2")},
    ]);
    tokio::fs::write(&path, serde_json::to_vec(&registry)?).await?;

    let directory = StaticDirectory::from_file(&config.token_hmac_key, &path.to_string_lossy()).await?;
    let first = directory.get_by_fingerprint(b"fp-1").await?;
    let second = directory.get_by_fingerprint(b"fp-2").await?;

    assert_eq!(first.title, "thermostat");
    assert_eq!(first.tags.get("room").map(String::as_str), Some("kitchen"));
    assert!(first.enabled && first.basic_enabled);
    assert!(!second.enabled, "expected flags to default to false");
    Ok(())
}
