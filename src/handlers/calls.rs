//! # Incoming Call Webhook
//!
//! The telephony provider POSTs here when a call arrives. The response is
//! markup instructing the provider what to do with the call: open a media
//! stream toward `/call/stream` (AI-powered mode) or dial the caller into a
//! conference (direct mode).
//!
//! A capacity-exhausted bridge still answers: the call is sent to a
//! conference instead of being rejected, because a live call is never
//! silently dropped.

use crate::call::session::ExecutionMode;
use crate::error::AppError;
use crate::state::AppState;
use crate::telephony::webhook;
use actix_web::{web, HttpRequest, HttpResponse};
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

/// Header carrying the provider's HMAC signature for webhook requests.
const SIGNATURE_HEADER: &str = "X-Twilio-Signature";

pub async fn incoming_call(
    req: HttpRequest,
    form: web::Form<HashMap<String, String>>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let config = state.get_config();
    let params: Vec<(String, String)> = form
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    if config.telephony.validate_signatures {
        let signature = req
            .headers()
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let webhook_url = format!(
            "{}/call/incoming",
            config.server.external_url.trim_end_matches('/')
        );

        if !webhook::verify_signature(
            &config.telephony.secret,
            &webhook_url,
            &params,
            signature,
        ) {
            warn!("Rejected webhook with invalid signature");
            return Err(AppError::Auth("Invalid webhook signature".to_string()));
        }
    }

    let call_sid = form.get("CallSid").cloned();

    if config.bridge.execution_mode == ExecutionMode::Direct {
        let room = format!(
            "direct-{}",
            call_sid.as_deref().unwrap_or("unidentified")
        );
        info!(room = %room, "Direct mode; dialing caller into conference");
        return Ok(xml_response(webhook::conference_response(&room)));
    }

    // Register the session now so the media stream's start event finds it.
    // Without a provider call id, a provisional id rides along in the
    // stream markup and is promoted when the start event names the call.
    let (session_id, provisional) = match call_sid {
        Some(sid) => (sid, false),
        None => (format!("prov-{}", Uuid::new_v4()), true),
    };

    match state.registry.create(&session_id, config.session_config()) {
        Ok(()) => {}
        Err(AppError::BadRequest(_)) => {
            // Webhook retry for a call we already registered
            info!(call_id = %session_id, "Duplicate webhook for known call");
        }
        Err(AppError::RateLimit { message, .. }) => {
            warn!(call_id = %session_id, "{}; answering with conference", message);
            let room = format!("overflow-{}", session_id);
            return Ok(xml_response(webhook::conference_response(&room)));
        }
        Err(e) => return Err(e),
    }

    let ws_url = external_ws_url(&config.server.external_url);
    info!(call_id = %session_id, "Answering call with media stream");

    let markup = webhook::media_stream_response(
        &ws_url,
        if provisional { Some(session_id.as_str()) } else { None },
    );
    Ok(xml_response(markup))
}

fn xml_response(markup: String) -> HttpResponse {
    HttpResponse::Ok().content_type("text/xml").body(markup)
}

/// Derive the media-stream WebSocket URL from the external base URL.
fn external_ws_url(external_url: &str) -> String {
    let base = external_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!("{}/call/stream", ws_base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_ws_url() {
        assert_eq!(
            external_ws_url("https://bridge.example.com"),
            "wss://bridge.example.com/call/stream"
        );
        assert_eq!(
            external_ws_url("http://localhost:8080/"),
            "ws://localhost:8080/call/stream"
        );
    }
}
