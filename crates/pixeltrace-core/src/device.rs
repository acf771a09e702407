use sha2::{Digest, Sha256};

/// Compute the device hash over the five fingerprint components.
///
/// Formula: `sha256(canvas | '|' | fonts | '|' | gpu | '|' | webgl | '|' | audio)`
/// encoded as 64 hex chars. Absent components join as empty strings so the
/// digest is a deterministic function of exactly these five inputs.
///
/// Returns `None` when all five components are absent — such hits (legacy
/// pixels with no fingerprint payload) carry a null device hash and do not
/// participate in the device dimension.
pub fn device_hash(
    canvas: Option<&str>,
    fonts: Option<&str>,
    gpu: Option<&str>,
    webgl: Option<&str>,
    audio: Option<&str>,
) -> Option<String> {
    if canvas.is_none() && fonts.is_none() && gpu.is_none() && webgl.is_none() && audio.is_none() {
        return None;
    }
    let joined = format!(
        "{}|{}|{}|{}|{}",
        canvas.unwrap_or(""),
        fonts.unwrap_or(""),
        gpu.unwrap_or(""),
        webgl.unwrap_or(""),
        audio.unwrap_or("")
    );
    Some(hex::encode(Sha256::digest(joined.as_bytes())))
}
