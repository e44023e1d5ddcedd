//! Source classification.

const NETWORK_PREFIXES: [&str; 3] = ["http", "rtsp", "/dev"];

/// Whether a source string names a network stream or a capture device.
///
/// Only the first four characters are inspected, case-insensitively.
pub fn is_network_source(source: &str) -> bool {
    let prefix: String = source.chars().take(4).collect::<String>().to_lowercase();
    NETWORK_PREFIXES.contains(&prefix.as_str())
}
