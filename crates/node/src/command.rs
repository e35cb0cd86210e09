use serde::Deserialize;

#[derive(Deserialize)]
struct PumpObject {
    pump: bool,
}

/// Parse a pump command payload.
///
/// Accepts `ON`/`OFF`, `1`/`0`, `true`/`false` (any case, surrounding
/// whitespace ignored) and the JSON object `{"pump": <bool>}`.
pub fn parse_command(payload: &[u8]) -> Result<bool, String> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| format!("command payload is not UTF-8: {e}"))?
        .trim();

    if text.starts_with('{') {
        return serde_json::from_str::<PumpObject>(text)
            .map(|o| o.pump)
            .map_err(|e| format!("bad command json: {e}"));
    }

    match text.to_ascii_lowercase().as_str() {
        "on" | "1" | "true" => Ok(true),
        "off" | "0" | "false" => Ok(false),
        _ => Err(format!("unknown pump command '{text}'")),
    }
}
