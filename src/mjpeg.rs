//! `multipart/x-mixed-replace` delivery of stream frames.
//!
//! Each part is a self-contained JPEG with its own Content-Length, so browsers
//! can show the feed with a plain `<img src=...>`. A client that reads slowly
//! simply gets fewer frames.

use std::convert::Infallible;
use axum::body::Body;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::stream::{self, Stream};
use tracing::debug;

use crate::frame::Frame;
use crate::hub::FrameSubscription;

pub const BOUNDARY: &str = "frame";

/// One multipart part: boundary line, headers, blank line, JPEG, CRLF.
pub fn encode_part(frame: &Frame) -> Bytes {
    let head = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        frame.len()
    );
    let mut part = BytesMut::with_capacity(head.len() + frame.len() + 2);
    part.put_slice(head.as_bytes());
    part.put_slice(&frame.data);
    part.put_slice(b"\r\n");
    part.freeze()
}

/// Encoded parts for one client. Ends when the producer goes away; dropping
/// the stream (client disconnect) releases the subscription.
pub fn part_stream(subscription: FrameSubscription) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
    stream::unfold(subscription, |mut subscription| async move {
        match subscription.next().await {
            Some(frame) => Some((Ok(encode_part(&frame)), subscription)),
            None => {
                debug!("Producer gone, ending MJPEG response");
                None
            }
        }
    })
}

pub fn response(subscription: FrameSubscription) -> Response {
    (
        [
            (header::CONTENT_TYPE, format!("multipart/x-mixed-replace; boundary={}", BOUNDARY)),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate".to_string()),
            (header::PRAGMA, "no-cache".to_string()),
        ],
        Body::from_stream(part_stream(subscription)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use futures_util::StreamExt;
    use crate::hub::FrameHub;

    #[test]
    fn test_part_layout() {
        let frame = Frame { seq: 1, data: Bytes::from_static(&[0xFF, 0xD8, 0x01, 0xFF, 0xD9]) };
        let part = encode_part(&frame);

        let head = b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 5\r\n\r\n";
        assert_eq!(&part[..head.len()], head);
        assert_eq!(&part[head.len()..head.len() + 5], &frame.data[..]);
        assert_eq!(&part[head.len() + 5..], b"\r\n");
    }

    #[tokio::test]
    async fn test_stream_ends_with_producer_and_releases_client() {
        let hub = Arc::new(FrameHub::new(Duration::from_millis(5)));
        let generation = hub.begin_generation();
        let mut parts = Box::pin(part_stream(hub.subscribe()));
        assert_eq!(hub.client_count(), 1);

        hub.publish(Bytes::from_static(b"\xFF\xD8jpeg\xFF\xD9"));
        let part = parts.next().await.unwrap().unwrap();
        assert!(part.starts_with(b"--frame\r\n"));

        hub.producer_exited(generation);
        assert!(parts.next().await.is_none());
        drop(parts);
        assert_eq!(hub.client_count(), 0);
    }
}
