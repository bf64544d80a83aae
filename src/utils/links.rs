use url::Url;

const SCHEMES: [&str; 2] = ["http://", "https://"];

/// Prepends `https://` unless the input already starts with `http://` or
/// `https://` (case-insensitive). Nothing else is validated.
pub fn normalize_url(input: &str) -> String {
    let has_scheme = SCHEMES.iter().any(|scheme| {
        input
            .get(..scheme.len())
            .map_or(false, |prefix| prefix.eq_ignore_ascii_case(scheme))
    });

    if has_scheme {
        input.to_string()
    } else {
        format!("https://{}", input)
    }
}

/// Host name shown next to a bookmark; falls back to the raw string when the
/// URL does not parse or has no host.
pub fn display_host(raw: &str) -> String {
    Url::parse(raw)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .unwrap_or_else(|| raw.to_string())
}
