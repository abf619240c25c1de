//! Cache fingerprints
//!
//! Deterministic keys derived from normalized request content, so that
//! semantically identical requests land on the same entry. Callers normalize
//! before calling; the text helpers additionally collapse whitespace so
//! "Hello  world" and "hello world" synthesize once.

fn hash_hex(bytes: &[u8]) -> String {
    format!("{:016x}", seahash::hash(bytes))
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Fingerprint for a synthesis request: normalized text plus voice id.
pub fn tts_key(text: &str, voice: &str) -> String {
    let material = format!("tts\x1f{}\x1f{}", voice.trim().to_lowercase(), normalize_text(text));
    hash_hex(material.as_bytes())
}

/// Fingerprint for a transcription request: content hash of the audio.
pub fn stt_key(audio: &[u8]) -> String {
    format!("stt-{}", hash_hex(audio))
}

/// Fingerprint for a completion request: prompt plus generation parameters.
/// `params` serializes with sorted keys, so field order never changes the key.
pub fn llm_key(prompt: &str, params: &serde_json::Value) -> String {
    let material = format!(
        "llm\x1f{}\x1f{}",
        normalize_text(prompt),
        serde_json::to_string(params).unwrap_or_default()
    );
    hash_hex(material.as_bytes())
}
