use std::path::Path;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Infer the `Content-Type` of a served file from its extension.
pub fn content_type_for(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match ext.as_deref() {
        Some("html") | Some("htm") => "text/html",
        Some("js") | Some("mjs") => "application/javascript",
        Some("css") => "text/css",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        // 3D models
        Some("glb") => "model/gltf-binary",
        Some("gltf") => "model/gltf+json",
        Some("fbx") => DEFAULT_CONTENT_TYPE,
        // Audio
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("ogg") => "audio/ogg",
        _ => DEFAULT_CONTENT_TYPE,
    }
}
