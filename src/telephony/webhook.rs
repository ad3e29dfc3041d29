//! # Webhook Verification and Markup Responses
//!
//! Inbound call-control webhooks are authenticated with the provider's
//! HMAC-SHA1 scheme: the signature covers the full webhook URL concatenated
//! with every POST parameter as `key` + `value`, sorted by key, and is
//! compared in constant time.
//!
//! The markup builders produce the XML responses that instruct the provider
//! what to do with the call: open a media stream toward this service, or
//! dial the caller into a conference room.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// The string the signature covers: the URL with every parameter appended
/// as `key` then `value`, sorted by key, no separators.
fn signed_payload(url: &str, params: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    let mut payload = String::from(url);
    for (key, value) in sorted {
        payload.push_str(key);
        payload.push_str(value);
    }
    payload
}

/// Compute the provider signature for a webhook request.
pub fn compute_signature(secret: &str, url: &str, params: &[(String, String)]) -> String {
    // HMAC accepts keys of any length; this cannot fail
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).expect("HMAC key");
    mac.update(signed_payload(url, params).as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// Verify a provider-supplied signature in constant time.
pub fn verify_signature(
    secret: &str,
    url: &str,
    params: &[(String, String)],
    provided: &str,
) -> bool {
    let provided_bytes = match BASE64.decode(provided) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).expect("HMAC key");
    mac.update(signed_payload(url, params).as_bytes());
    // verify_slice is a constant-time comparison
    mac.verify_slice(&provided_bytes).is_ok()
}

/// Markup instructing the provider to open a bidirectional media stream.
///
/// When a provisional session id exists (outbound calls created before the
/// provider assigned the real call id), it rides along as a custom stream
/// parameter so the bridge can promote it on the `start` event.
pub fn media_stream_response(ws_url: &str, session_id: Option<&str>) -> String {
    match session_id {
        Some(id) => format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <Response><Connect><Stream url=\"{}\">\
             <Parameter name=\"session_id\" value=\"{}\"/>\
             </Stream></Connect></Response>",
            xml_escape(ws_url),
            xml_escape(id)
        ),
        None => format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <Response><Connect><Stream url=\"{}\"/></Connect></Response>",
            xml_escape(ws_url)
        ),
    }
}

/// Markup dialing the caller into a named conference room.
pub fn conference_response(room: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <Response><Dial><Conference>{}</Conference></Dial></Response>",
        xml_escape(room)
    )
}

fn xml_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_signature_round_trip() {
        let secret = "s3cret";
        let url = "https://bridge.example.com/call/incoming";
        let body = params(&[("CallSid", "CA123"), ("From", "+15551234567")]);

        let signature = compute_signature(secret, url, &body);
        assert!(verify_signature(secret, url, &body, &signature));
    }

    /// The signature is over sorted parameters, so arrival order of form
    /// fields must not matter.
    #[test]
    fn test_signature_independent_of_param_order() {
        let secret = "s3cret";
        let url = "https://bridge.example.com/call/incoming";
        let forward = params(&[("A", "1"), ("B", "2")]);
        let reversed = params(&[("B", "2"), ("A", "1")]);

        assert_eq!(
            compute_signature(secret, url, &forward),
            compute_signature(secret, url, &reversed)
        );
    }

    #[test]
    fn test_tampered_request_rejected() {
        let secret = "s3cret";
        let url = "https://bridge.example.com/call/incoming";
        let body = params(&[("CallSid", "CA123")]);
        let signature = compute_signature(secret, url, &body);

        let tampered = params(&[("CallSid", "CA999")]);
        assert!(!verify_signature(secret, url, &tampered, &signature));
        assert!(!verify_signature("wrong", url, &body, &signature));
        assert!(!verify_signature(secret, url, &body, "not-base64!!"));
    }

    #[test]
    fn test_media_stream_markup() {
        let markup = media_stream_response("wss://bridge.example.com/call/stream", None);
        assert!(markup.contains("<Connect>"));
        assert!(markup.contains("wss://bridge.example.com/call/stream"));
        assert!(!markup.contains("Parameter"));

        let with_session =
            media_stream_response("wss://bridge.example.com/call/stream", Some("prov-1"));
        assert!(with_session.contains("<Parameter name=\"session_id\" value=\"prov-1\"/>"));
    }

    #[test]
    fn test_conference_markup_escapes_room() {
        let markup = conference_response("takeover-CA1<test>");
        assert!(markup.contains("<Conference>takeover-CA1&lt;test&gt;</Conference>"));
    }
}
