//! Endpoint URL helpers for provider base URLs.

/// Strip trailing slashes so endpoints can be appended without doubling them.
///
/// ```
/// use chatpipe::utils::url::normalize_base_url;
///
/// assert_eq!(normalize_base_url("http://localhost:11434/v1//"), "http://localhost:11434/v1");
/// ```
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim().trim_end_matches('/').to_string()
}

/// Join a base URL and an endpoint path with exactly one slash.
///
/// ```
/// use chatpipe::utils::url::construct_api_url;
///
/// assert_eq!(
///     construct_api_url("https://api.example.com/v1/", "/chat/completions"),
///     "https://api.example.com/v1/chat/completions"
/// );
/// ```
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    format!(
        "{}/{}",
        normalize_base_url(base_url),
        endpoint.trim_start_matches('/')
    )
}

/// Whether a configured base URL can be used for requests at all.
pub fn is_http_url(base_url: &str) -> bool {
    reqwest::Url::parse(base_url.trim())
        .map(|url| matches!(url.scheme(), "http" | "https") && url.has_host())
        .unwrap_or(false)
}
