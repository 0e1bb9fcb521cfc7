//! Responses synthesized when neither the network nor a cache tier can answer.

use serde_json::json;

use crate::http::{FetchResponse, QUEUED_ID_HEADER};

/// Served for navigations when the network is down and nothing is cached.
pub const OFFLINE_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Offline</title>
  <style>
    body { font-family: system-ui, sans-serif; display: flex; align-items: center; justify-content: center; min-height: 100vh; margin: 0; background: #f5f5f5; color: #333; }
    main { text-align: center; max-width: 28rem; padding: 2rem; }
    button { margin-top: 1rem; padding: 0.5rem 1.5rem; border: 0; border-radius: 4px; background: #2563eb; color: #fff; cursor: pointer; }
  </style>
</head>
<body>
  <main>
    <h1>You are offline</h1>
    <p>This page is not available without a connection. Changes you make elsewhere are saved and will be sent when you reconnect.</p>
    <button onclick="location.reload()">Try again</button>
  </main>
</body>
</html>
"#;

/// API read with no network and no cached copy.
pub fn offline_payload() -> FetchResponse {
  FetchResponse::json(503, &json!({ "error": "Offline", "cached": false }))
}

/// Mutation accepted into the offline queue but not yet applied.
pub fn queued_response(request_id: &str) -> FetchResponse {
  FetchResponse::json(
    202,
    &json!({
      "queued": true,
      "requestId": request_id,
      "message": "Request queued; it will be sent when the connection returns",
    }),
  )
  .with_header(QUEUED_ID_HEADER, request_id)
}
