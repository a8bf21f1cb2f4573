//! The tracking pixel served by the front door.

use axum::{
  http::header,
  response::{IntoResponse, Response},
};

/// A 1x1 transparent GIF89a.
pub const PIXEL_GIF: &[u8] = &[
  0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00,
  0x00, 0xff, 0x00, 0x00, 0xff, 0x00, 0x00, 0x21, 0xf9, 0x04, 0x01, 0x0a,
  0x00, 0x01, 0x00, 0x2c, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00,
  0x00, 0x02, 0x02, 0x4c, 0x01, 0x00, 0x3b,
];

/// The pixel response. Uncacheable, so every render of the email reaches us.
pub fn response() -> Response {
  (
    [
      (header::CONTENT_TYPE, "image/gif"),
      (header::CACHE_CONTROL, "no-store, no-cache, must-revalidate, max-age=0"),
      (header::PRAGMA, "no-cache"),
    ],
    PIXEL_GIF,
  )
    .into_response()
}
