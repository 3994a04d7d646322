use cookie::time::Duration;
use cookie::{Cookie, CookieJar, SameSite};
use http::header;
use http::HeaderMap;

// return empty cookie jar for unparsable cookies
pub fn parse_cookies_to_jar(s: &str) -> CookieJar {
    let cookie_str = s.trim().to_owned();
    let mut jar = CookieJar::new();
    let cookies = Cookie::split_parse(cookie_str).filter_map(Result::ok);

    for cookie in cookies {
        jar.add_original(cookie);
    }

    jar
}

/// Collects every `Cookie` header on the request into one jar.
pub fn handle_request_cookies(headers: &HeaderMap) -> Option<CookieJar> {
    let mut values = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .peekable();

    if values.peek().is_none() {
        log::debug!("No cookie header found in request");
        return None;
    }

    Some(parse_cookies_to_jar(&values.collect::<Vec<_>>().join("; ")))
}

/// Value of a single named cookie, if present.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    handle_request_cookies(headers)
        .and_then(|jar| jar.get(name).map(|cookie| cookie.value().to_string()))
}

/// Renders a `Set-Cookie` value scoped to the exchange's cookie domain.
///
/// Sync cookies are read in third-party contexts, so they are always
/// `SameSite=None; Secure`.
pub fn build_set_cookie(name: &str, value: &str, domain: &str, max_age_days: u32) -> String {
    let mut cookie = Cookie::build((name.to_string(), value.to_string()))
        .path("/")
        .secure(true)
        .same_site(SameSite::None)
        .max_age(Duration::days(i64::from(max_age_days)))
        .build();

    if !domain.is_empty() {
        cookie.set_domain(domain.to_string());
    }

    cookie.to_string()
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    #[test]
    fn test_parse_cookies_to_jar() {
        let header_value = "c1=v1; c2=v2";
        let jar = parse_cookies_to_jar(header_value);

        assert!(jar.iter().count() == 2);
        assert_eq!(jar.get("c1").expect("should have c1").value(), "v1");
        assert_eq!(jar.get("c2").expect("should have c2").value(), "v2");
    }

    #[test]
    fn test_parse_cookies_to_jar_not_unique() {
        let jar = parse_cookies_to_jar("c1=v1;c1=v2");

        assert!(jar.iter().count() == 1);
        assert_eq!(jar.get("c1").expect("should have c1").value(), "v2");
    }

    #[test]
    fn test_parse_cookies_to_jar_empty() {
        assert!(parse_cookies_to_jar("").iter().count() == 0);
    }

    #[test]
    fn test_parse_cookies_to_jar_invalid() {
        assert!(parse_cookies_to_jar("invalid").iter().count() == 0);
    }

    #[test]
    fn test_cookie_value_across_headers() {
        let mut headers = HeaderMap::new();
        headers.append(header::COOKIE, HeaderValue::from_static("a=1"));
        headers.append(header::COOKIE, HeaderValue::from_static("uids=abc; b=2"));

        assert_eq!(cookie_value(&headers, "uids").as_deref(), Some("abc"));
        assert_eq!(cookie_value(&headers, "b").as_deref(), Some("2"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn test_cookie_value_no_header() {
        assert_eq!(cookie_value(&HeaderMap::new(), "uids"), None);
    }

    #[test]
    fn test_build_set_cookie() {
        let value = build_set_cookie("uids", "abc", ".exchange.test", 14);

        assert!(value.starts_with("uids=abc"), "unexpected cookie: {value}");
        assert!(value.contains("Domain=exchange.test") || value.contains("Domain=.exchange.test"));
        assert!(value.contains("Path=/"));
        assert!(value.contains("Secure"));
        assert!(value.contains("SameSite=None"));
        assert!(value.contains("Max-Age=1209600"));
    }
}
