use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use winnow::ascii::digit1;
use winnow::combinator::{delimited, opt, preceded, terminated};
use winnow::token::take_while;
use winnow::{PResult, Parser};

/// Where a `[REFERRAL/...]` backend response points. The authority part of
/// the referral URI: `userinfo@host[:port]`, with an optional scheme prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectTarget {
    pub user: Option<String>,
    pub host: RedirectHost,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectHost {
    Ip(IpAddr),
    Name(String),
}

impl fmt::Display for RedirectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{user}")?;
        }
        write!(f, "@")?;
        match &self.host {
            RedirectHost::Ip(IpAddr::V6(v6)) => write!(f, "[{v6}]")?,
            RedirectHost::Ip(IpAddr::V4(v4)) => write!(f, "{v4}")?,
            RedirectHost::Name(name) => write!(f, "{name}")?,
        }
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

fn is_userinfo_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-._~!$&'()*+,;=:%".contains(c)
}

fn scheme<'s>(input: &mut &'s str) -> PResult<&'s str> {
    terminated(
        take_while(1.., |c: char| c.is_ascii_alphanumeric() || "+-.".contains(c)),
        "://",
    )
    .parse_next(input)
}

fn userinfo(input: &mut &str) -> PResult<String> {
    terminated(take_while(0.., is_userinfo_char), '@')
        .map(percent_decode)
        .parse_next(input)
}

fn host(input: &mut &str) -> PResult<RedirectHost> {
    if input.starts_with('[') {
        return delimited(
            '[',
            take_while(1.., |c: char| c.is_ascii_hexdigit() || c == ':' || c == '.'),
            ']',
        )
        .try_map(|s: &str| s.parse::<Ipv6Addr>())
        .map(|v6| RedirectHost::Ip(IpAddr::V6(v6)))
        .parse_next(input);
    }
    take_while(1.., |c: char| c.is_ascii_alphanumeric() || "-._".contains(c))
        .map(|name: &str| match name.parse::<IpAddr>() {
            Ok(ip) => RedirectHost::Ip(ip),
            Err(_) => RedirectHost::Name(name.to_string()),
        })
        .parse_next(input)
}

fn port(input: &mut &str) -> PResult<u16> {
    preceded(':', digit1)
        .try_map(|s: &str| s.parse::<u16>())
        .verify(|p| *p != 0)
        .parse_next(input)
}

fn referral(input: &mut &str) -> PResult<RedirectTarget> {
    preceded(
        "[REFERRAL/",
        terminated(
            (opt(scheme), opt(userinfo), host, opt(port)),
            ']',
        ),
    )
    .map(|(_scheme, user, host, port)| RedirectTarget { user, host, port })
    .parse_next(input)
}

fn percent_decode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 3 <= bytes.len() {
            if let Ok(v) = u8::from_str_radix(&raw[i + 1..i + 3], 16) {
                out.push(v as char);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

/// Parse the payload of an error line (the part after `-ERR `) as a referral.
/// Returns `None` when it isn't one, or when the target is malformed.
pub fn parse_referral(resp: &str) -> Option<RedirectTarget> {
    if !resp.starts_with("[REFERRAL/") {
        return None;
    }
    let mut input = resp;
    referral.parse_next(&mut input).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scheme_user_ip_and_port() {
        let target = parse_referral("[REFERRAL/pop3://bob@10.0.0.2:110] try elsewhere").unwrap();
        assert_eq!(target.user.as_deref(), Some("bob"));
        assert_eq!(target.host, RedirectHost::Ip("10.0.0.2".parse().unwrap()));
        assert_eq!(target.port, Some(110));
        assert_eq!(target.to_string(), "bob@10.0.0.2:110");
    }

    #[test]
    fn scheme_and_user_and_port_are_optional() {
        let target = parse_referral("[REFERRAL/backend3.example.com]").unwrap();
        assert_eq!(target.user, None);
        assert_eq!(target.host, RedirectHost::Name("backend3.example.com".to_string()));
        assert_eq!(target.port, None);
        assert_eq!(target.to_string(), "@backend3.example.com");
    }

    #[test]
    fn parses_bracketed_ipv6_hosts() {
        let target = parse_referral("[REFERRAL/pop3://bob@[2001:db8::1]:995]").unwrap();
        assert_eq!(target.host, RedirectHost::Ip("2001:db8::1".parse().unwrap()));
        assert_eq!(target.to_string(), "bob@[2001:db8::1]:995");
    }

    #[test]
    fn percent_encoded_userinfo_is_decoded() {
        let target = parse_referral("[REFERRAL/b%40b@10.0.0.2:110]").unwrap();
        assert_eq!(target.user.as_deref(), Some("b@b"));
    }

    #[test]
    fn rejects_non_referrals_and_garbage() {
        assert_eq!(parse_referral("[SYS/TEMP] busy"), None);
        assert_eq!(parse_referral("[REFERRAL/]"), None);
        assert_eq!(parse_referral("[REFERRAL/bob@10.0.0.2:110"), None);
        assert_eq!(parse_referral("[REFERRAL/bob@10.0.0.2:0]"), None);
    }
}
