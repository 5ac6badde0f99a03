//! Keyless ad-hoc proxying: `/sandbox?url=...&failrate=...&failCodes=...&minLatency=...&maxLatency=...`

use crate::chaos::ChaosConfig;
use crate::config::direct_target;
use crate::errors::ProxyError;
use crate::types::Target;
use url::Url;
use url::form_urlencoded;

pub const SANDBOX_PATH: &str = "/sandbox";

/// A sandbox request decoded from its query string.
#[derive(Debug, PartialEq)]
pub struct SandboxRequest {
    pub target: Target,
    /// Full upstream path, taken verbatim from `url`.
    pub path: String,
    pub query: Option<String>,
    pub chaos: ChaosConfig,
}

/// Parses a comma-separated list of status codes. Blank entries are skipped.
pub fn parse_fail_codes(raw: &str) -> Result<Vec<u16>, ProxyError> {
    raw.split(',')
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .map(|code| {
            code.parse::<u16>()
                .map_err(|_| ProxyError::InvalidRequest(format!("invalid fail code: {code}")))
        })
        .collect()
}

pub fn parse_request(query: Option<&str>) -> Result<SandboxRequest, ProxyError> {
    let mut url = None;
    let mut chaos = ChaosConfig::default();

    for (name, value) in form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
        match name.as_ref() {
            "url" => url = Some(value.into_owned()),
            "failrate" => chaos.failure_percentage = parse_fail_rate(&value)?,
            "failCodes" => chaos.error_codes = parse_fail_codes(&value)?,
            "minLatency" => chaos.min_latency = parse_number("minLatency", &value)?,
            "maxLatency" => chaos.max_latency = parse_number("maxLatency", &value)?,
            _ => {}
        }
    }

    // Only a lower bound given: fixed latency.
    if chaos.max_latency == 0 {
        chaos.max_latency = chaos.min_latency;
    }
    chaos
        .validate()
        .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;

    let url = url.ok_or_else(|| ProxyError::InvalidRequest("url parameter is required".into()))?;
    let mut url = Url::parse(&url)
        .map_err(|e| ProxyError::InvalidRequest(format!("invalid url: {e}")))?;
    let query = url.query().map(String::from);
    url.set_query(None);

    let mut target = direct_target("sandbox", &url)
        .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
    target.base_path = String::new();

    Ok(SandboxRequest {
        target,
        path: url.path().to_string(),
        query,
        chaos,
    })
}

/// `failrate` is a fraction between 0 and 1 in whole-percent steps.
fn parse_fail_rate(raw: &str) -> Result<u8, ProxyError> {
    let rate: f64 = raw
        .trim()
        .parse()
        .map_err(|_| ProxyError::InvalidRequest(format!("invalid failrate: {raw}")))?;
    if !(0.0..=1.0).contains(&rate) {
        return Err(ProxyError::InvalidRequest(format!(
            "failrate must be between 0 and 1, got {raw}"
        )));
    }
    let percentage = rate * 100.0;
    if (percentage - percentage.round()).abs() > 1e-6 {
        return Err(ProxyError::InvalidRequest(format!(
            "failrate must be a whole percentage, got {raw}"
        )));
    }
    Ok(percentage.round() as u8)
}

fn parse_number(name: &str, raw: &str) -> Result<u64, ProxyError> {
    raw.trim()
        .parse()
        .map_err(|_| ProxyError::InvalidRequest(format!("invalid {name}: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fail_codes() {
        assert_eq!(parse_fail_codes("500,503").unwrap(), vec![500, 503]);
        assert_eq!(parse_fail_codes(" 502 , ,504,").unwrap(), vec![502, 504]);
        assert!(parse_fail_codes("").unwrap().is_empty());
        assert!(matches!(
            parse_fail_codes("500,oops"),
            Err(ProxyError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_parse_request() {
        let request = parse_request(Some(
            "url=http%3A%2F%2F127.0.0.1%3A8080%2Fusers%3Fpage%3D2&failrate=0.25&failCodes=503,504&minLatency=10&maxLatency=50",
        ))
        .unwrap();

        assert_eq!(request.target.host, "127.0.0.1");
        assert_eq!(request.target.port, 8080);
        assert!(!request.target.use_tls);
        assert_eq!(request.path, "/users");
        assert_eq!(request.query.as_deref(), Some("page=2"));
        assert_eq!(
            request.chaos,
            ChaosConfig {
                min_latency: 10,
                max_latency: 50,
                failure_percentage: 25,
                error_codes: vec![503, 504],
            }
        );
    }

    #[test]
    fn test_defaults() {
        let request = parse_request(Some("url=https://example.com")).unwrap();
        assert_eq!(request.target.port, 443);
        assert!(request.target.use_tls);
        assert_eq!(request.path, "/");
        assert_eq!(request.chaos, ChaosConfig::default());

        let fixed = parse_request(Some("url=https://example.com&minLatency=30")).unwrap();
        assert_eq!(fixed.chaos.min_latency, 30);
        assert_eq!(fixed.chaos.max_latency, 30);
    }

    #[test]
    fn test_fail_rate_steps() {
        for (raw, expected) in [("0", 0), ("0.01", 1), ("0.29", 29), ("0.57", 57), ("1", 100)] {
            let request = parse_request(Some(&format!("url=https://example.com&failrate={raw}")))
                .unwrap();
            assert_eq!(request.chaos.failure_percentage, expected, "{raw}");
        }
    }

    #[test]
    fn test_invalid_requests() {
        for query in [
            None,
            Some("failrate=0.5"),
            Some("url=not-a-url"),
            Some("url=ftp://example.com/file"),
            Some("url=https://example.com&failrate=1.5"),
            Some("url=https://example.com&failrate=abc"),
            Some("url=https://example.com&failrate=0.004"),
            Some("url=https://example.com&failrate=0.125"),
            Some("url=https://example.com&minLatency=-1"),
            Some("url=https://example.com&minLatency=50&maxLatency=10"),
            Some("url=https://example.com&failCodes=700"),
        ] {
            let err = parse_request(query).unwrap_err();
            assert!(
                matches!(err, ProxyError::InvalidRequest(_)),
                "{query:?} gave {err:?}"
            );
        }
    }
}
