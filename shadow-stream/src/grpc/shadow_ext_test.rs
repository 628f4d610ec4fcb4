use std::convert::TryFrom;

use anyhow::Result;
use serde_json::json;
use shadow_core::models::{ConnectionState, Shadow, State};
use shadow_core::AppError;

use crate::grpc::{ShadowDocument, ShadowState};

#[test]
fn shadow_converts_to_document_with_json_data() -> Result<()> {
    let shadow = Shadow {
        reported: Some(State { version: 3, data: json!({"temp": 20}), timestamp: 10 }),
        connection: Some(ConnectionState { connected: true, client_id: "c1".into(), timestamp: 11 }),
        ..Shadow::new("dev-1")
    };
    let doc = ShadowDocument::from(shadow.clone());
    assert_eq!(doc.device, "dev-1");
    assert_eq!(doc.reported, Some(ShadowState { version: 3, data: r#"{"temp":20}"#.into(), timestamp: 10 }));
    assert!(doc.desired.is_none());

    assert_eq!(Shadow::try_from(doc)?, shadow);
    Ok(())
}

#[test]
fn document_with_invalid_json_is_rejected() {
    let doc = ShadowDocument {
        device: "dev-1".into(),
        desired: Some(ShadowState { version: 0, data: "{nope".into(), timestamp: 0 }),
        ..Default::default()
    };
    let res = Shadow::try_from(doc);
    assert!(matches!(res, Err(AppError::InvalidInput(_))), "expected invalid input, got {:?}", res);
}
