//! Public server status.

use axum::Json;
use axum::extract::State;
use serde::{Deserialize, Serialize};

use crate::AppState;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    name: String,
    version: String,
}

pub async fn handler(State(state): State<AppState>) -> Json<Status> {
    let name = if state.config.name.is_empty() {
        env!("CARGO_CRATE_NAME").to_owned()
    } else {
        state.config.name.clone()
    };

    Json(Status {
        name,
        version: env!("CARGO_PKG_VERSION").into(),
    })
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};

    use super::*;
    use crate::router::testing::{json, state};
    use crate::{app, make_request};

    #[tokio::test]
    async fn test_status_handler() {
        let test = state();

        let response = make_request(
            None,
            app(test.state.clone()),
            Method::GET,
            "/status.json",
            String::new(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body: Status = serde_json::from_value(json(response).await).unwrap();
        assert_eq!(
            body,
            Status {
                name: "encore".into(),
                version: env!("CARGO_PKG_VERSION").into(),
            }
        );
    }
}
