use std::convert::TryFrom;

use shadow_core::models::{ConnectionState, Shadow, State};
use shadow_core::AppError;

use crate::grpc::shadow::{ShadowConnection, ShadowDocument, ShadowState};

impl From<Shadow> for ShadowDocument {
    fn from(shadow: Shadow) -> Self {
        Self {
            device: shadow.device,
            reported: shadow.reported.map(ShadowState::from),
            desired: shadow.desired.map(ShadowState::from),
            connection: shadow.connection.map(|conn| ShadowConnection {
                connected: conn.connected,
                client_id: conn.client_id,
                timestamp: conn.timestamp,
            }),
        }
    }
}

impl From<State> for ShadowState {
    fn from(state: State) -> Self {
        Self {
            version: state.version,
            data: state.data.to_string(),
            timestamp: state.timestamp,
        }
    }
}

impl TryFrom<ShadowState> for State {
    type Error = AppError;

    fn try_from(state: ShadowState) -> Result<Self, Self::Error> {
        let data = serde_json::from_str(&state.data).map_err(|err| AppError::InvalidInput(format!("state data is not valid JSON: {}", err)))?;
        Ok(Self {
            version: state.version,
            data,
            timestamp: state.timestamp,
        })
    }
}

impl TryFrom<ShadowDocument> for Shadow {
    type Error = AppError;

    fn try_from(doc: ShadowDocument) -> Result<Self, Self::Error> {
        Ok(Self {
            device: doc.device,
            reported: doc.reported.map(State::try_from).transpose()?,
            desired: doc.desired.map(State::try_from).transpose()?,
            connection: doc.connection.map(|conn| ConnectionState {
                connected: conn.connected,
                client_id: conn.client_id,
                timestamp: conn.timestamp,
            }),
        })
    }
}
