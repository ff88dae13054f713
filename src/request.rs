//! The request/response engine shared by every lockdownd verb.
//!
//! Grounded on the request/response dict shape used throughout
//! `examples/other_examples/354c9c1f_..._idevice-src-lockdown.rs.rs` and the
//! stricter-than-the-original validation decision recorded in
//! `SPEC_FULL.md` §9 / `DESIGN.md`: a missing `Result` field is a protocol
//! error for every verb except `QueryType`.

use plist::Dictionary;
use plist::Value;

use crate::error::LockdownError;
use crate::framing::Channel;

/// Builds and sends a request dict for `verb`, merging in `extra_fields` and
/// the client's label (if set), then receives and validates the response.
pub async fn call(
    channel: &mut Channel,
    verb: &str,
    extra_fields: Dictionary,
    label: Option<&str>,
) -> Result<Dictionary, LockdownError> {
    let mut dict = extra_fields;
    dict.insert("Request".to_string(), Value::String(verb.to_string()));
    if let Some(label) = label {
        dict.insert("Label".to_string(), Value::String(label.to_string()));
    }

    channel.send_plist(&Value::Dictionary(dict)).await?;
    let response = channel.recv_plist().await?;
    let response = response
        .into_dictionary()
        .ok_or_else(|| LockdownError::Plist("response was not a dictionary".to_string()))?;

    validate(&response, verb)?;
    Ok(response)
}

/// Validates that `response` is a well-formed reply to `verb`: `Request`
/// echoes `verb`, and (except for `QueryType`, which never carries a
/// `Result` field) `Result` is present and is `"Success"` or `"Failure"`.
fn validate(response: &Dictionary, verb: &str) -> Result<(), LockdownError> {
    let echoed = response
        .get("Request")
        .and_then(Value::as_string)
        .ok_or_else(|| LockdownError::Plist("response missing Request field".to_string()))?;
    if echoed != verb {
        return Err(LockdownError::Plist(format!(
            "expected response to {verb}, got response to {echoed}"
        )));
    }

    if verb == "QueryType" {
        return Ok(());
    }

    match response.get("Result").and_then(Value::as_string) {
        Some("Success") | Some("Failure") => Ok(()),
        Some(other) => Err(LockdownError::Plist(format!(
            "unexpected Result value: {other}"
        ))),
        None => Err(LockdownError::Plist(
            "response missing Result field".to_string(),
        )),
    }
}

/// `true` if the response dict indicates success.
pub fn succeeded(response: &Dictionary) -> bool {
    response.get("Result").and_then(Value::as_string) == Some("Success")
}

/// Extracts the device's `Error` string from a failed response, if present.
pub fn error_string(response: &Dictionary) -> Option<&str> {
    response.get("Error").and_then(Value::as_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SharedConn;
    use tokio::io::duplex;

    fn respond(verb: &str, extra: Dictionary) -> Vec<u8> {
        let mut dict = extra;
        dict.insert("Request".to_string(), Value::String(verb.to_string()));
        let mut body = Vec::new();
        Value::Dictionary(dict).to_writer_xml(&mut body).unwrap();
        let mut frame = (body.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(&body);
        frame
    }

    #[tokio::test]
    async fn call_validates_matching_request_echo() {
        let (mut device_side, client_side) = duplex(4096);
        let mut channel = Channel::new(SharedConn::new(Box::new(client_side)));

        let mut response_fields = Dictionary::new();
        response_fields.insert("Result".to_string(), Value::String("Success".to_string()));
        let frame = respond("QueryType", response_fields);

        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut len_buf = [0u8; 4];
            device_side.read_exact(&mut len_buf).await.unwrap();
            let len = u32::from_be_bytes(len_buf);
            let mut body = vec![0u8; len as usize];
            device_side.read_exact(&mut body).await.unwrap();
            device_side.write_all(&frame).await.unwrap();
        });

        let response = call(&mut channel, "QueryType", Dictionary::new(), None)
            .await
            .unwrap();
        assert_eq!(
            response.get("Request").and_then(Value::as_string),
            Some("QueryType")
        );
    }

    #[tokio::test]
    async fn call_rejects_mismatched_request_echo() {
        let (mut device_side, client_side) = duplex(4096);
        let mut channel = Channel::new(SharedConn::new(Box::new(client_side)));

        let mut response_fields = Dictionary::new();
        response_fields.insert("Result".to_string(), Value::String("Success".to_string()));
        let frame = respond("WrongVerb", response_fields);

        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut len_buf = [0u8; 4];
            device_side.read_exact(&mut len_buf).await.unwrap();
            let len = u32::from_be_bytes(len_buf);
            let mut body = vec![0u8; len as usize];
            device_side.read_exact(&mut body).await.unwrap();
            device_side.write_all(&frame).await.unwrap();
        });

        let err = call(&mut channel, "QueryType", Dictionary::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LockdownError::Plist(_)));
    }
}
