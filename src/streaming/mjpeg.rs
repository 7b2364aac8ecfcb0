// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! MJPEG multipart 分帧

/// multipart 分隔符
pub const BOUNDARY: &str = "frame";

/// HTTP 响应的 Content-Type
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// 一帧 JPEG → 一个 multipart 分段
///
/// `--frame\r\nContent-Type: image/jpeg\r\nContent-Length: <n>\r\n\r\n<bytes>\r\n`
pub fn format_part(jpeg: &[u8]) -> Vec<u8> {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        jpeg.len()
    );
    let mut part = Vec::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}
