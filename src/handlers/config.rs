use crate::{error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Effective configuration with credentials masked.
pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = serde_json::to_value(state.config().redacted())?;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::pipeline::testing::Fakes;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_config_view_masks_credentials() {
        let mut config = AppConfig::default();
        config.openai.api_key = Some("sk-secret".to_string());
        let state = AppState::new(config, Fakes::default().adapters());

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/config", web::get().to(get_config)),
        )
        .await;
        let req = test::TestRequest::get().uri("/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["config"]["openai"]["api_key"], "***");
        assert_eq!(body["config"]["server"]["port"], 8000);
        assert!(!body.to_string().contains("sk-secret"));
    }
}
