//! Stable device identity derived from client-supplied material.
//!
//! The id must survive reconnects, so it is a pure function of the user
//! agent, the client address, and the accept-language header. Mobile
//! Safari/WebKit clients churn addresses across cellular and Wi-Fi, so
//! their seed deliberately excludes the address; fragmenting identity
//! there is worse than the occasional collision, which is tolerated and
//! treated as the same device.

use std::net::IpAddr;

use beamdrop_shared::DeviceKind;

/// Everything the connection manager learns about a client before the
/// first frame arrives.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub device_id: String,
    pub kind: DeviceKind,
    pub platform: String,
    pub browser: String,
    pub default_name: String,
    /// iPhone/iPad/iPod UA: immediate welcome, small chunk size, short
    /// heartbeat period.
    pub mobile_safari: bool,
}

/// Derive the stable identity for a connecting client.
pub fn derive(user_agent: &str, addr: Option<IpAddr>, accept_language: &str) -> ClientIdentity {
    let mobile_safari = is_mobile_webkit(user_agent);

    let seed = if mobile_safari {
        format!("{user_agent}|{accept_language}")
    } else {
        let addr = addr.map(|a| a.to_string()).unwrap_or_default();
        format!("{user_agent}|{addr}|{accept_language}")
    };

    let prefix = if mobile_safari { "ios" } else { "device" };
    let device_id = format!("{prefix}-{}", base36(rolling_hash(&seed)));

    let platform = platform_of(user_agent).to_string();
    let browser = browser_of(user_agent).to_string();
    let kind = kind_of(user_agent);
    let default_name = format!("{browser} on {platform}");

    ClientIdentity {
        device_id,
        kind,
        platform,
        browser,
        default_name,
        mobile_safari,
    }
}

pub fn is_mobile_webkit(user_agent: &str) -> bool {
    user_agent.contains("iPhone") || user_agent.contains("iPad") || user_agent.contains("iPod")
}

/// 32-bit rolling hash, equivalent to Java's `String.hashCode`.
fn rolling_hash(seed: &str) -> u32 {
    let mut h: i32 = 0;
    for c in seed.chars() {
        h = h.wrapping_mul(31).wrapping_add(c as i32);
    }
    h.unsigned_abs()
}

fn base36(mut n: u32) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ascii")
}

fn platform_of(ua: &str) -> &'static str {
    if is_mobile_webkit(ua) {
        "iOS"
    } else if ua.contains("Android") {
        "Android"
    } else if ua.contains("Windows") {
        "Windows"
    } else if ua.contains("Mac OS X") || ua.contains("Macintosh") {
        "macOS"
    } else if ua.contains("CrOS") {
        "ChromeOS"
    } else if ua.contains("Linux") || ua.contains("X11") {
        "Linux"
    } else {
        "Unknown"
    }
}

fn browser_of(ua: &str) -> &'static str {
    // Order matters: Chrome-family UAs all contain "Safari".
    if ua.contains("Edg/") || ua.contains("EdgiOS") {
        "Edge"
    } else if ua.contains("OPR/") || ua.contains("Opera") {
        "Opera"
    } else if ua.contains("Firefox") || ua.contains("FxiOS") {
        "Firefox"
    } else if ua.contains("Chrome") || ua.contains("CriOS") {
        "Chrome"
    } else if ua.contains("Safari") {
        "Safari"
    } else {
        "Browser"
    }
}

fn kind_of(ua: &str) -> DeviceKind {
    if ua.contains("iPad") || (ua.contains("Android") && !ua.contains("Mobile")) {
        DeviceKind::Tablet
    } else if ua.contains("iPhone") || ua.contains("iPod") || ua.contains("Mobile") {
        DeviceKind::Mobile
    } else if ua.contains("Windows")
        || ua.contains("Macintosh")
        || ua.contains("Linux")
        || ua.contains("X11")
        || ua.contains("CrOS")
    {
        DeviceKind::Desktop
    } else {
        DeviceKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESKTOP_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
        (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
    const IPHONE_UA: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) \
        AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1";

    #[test]
    fn deterministic_for_same_inputs() {
        let addr: IpAddr = "192.168.1.10".parse().unwrap();
        let a = derive(DESKTOP_UA, Some(addr), "en-US");
        let b = derive(DESKTOP_UA, Some(addr), "en-US");
        assert_eq!(a.device_id, b.device_id);
        assert!(a.device_id.starts_with("device-"));
    }

    #[test]
    fn desktop_id_varies_with_address() {
        let a = derive(DESKTOP_UA, Some("10.0.0.1".parse().unwrap()), "en-US");
        let b = derive(DESKTOP_UA, Some("10.0.0.2".parse().unwrap()), "en-US");
        assert_ne!(a.device_id, b.device_id);
    }

    #[test]
    fn mobile_safari_id_ignores_address() {
        let a = derive(IPHONE_UA, Some("10.0.0.1".parse().unwrap()), "en-US");
        let b = derive(IPHONE_UA, Some("172.16.9.9".parse().unwrap()), "en-US");
        assert_eq!(a.device_id, b.device_id);
        assert!(a.device_id.starts_with("ios-"));
        assert!(a.mobile_safari);
    }

    #[test]
    fn rolling_hash_matches_java_string_hash() {
        // "abc".hashCode() == 96354 in Java.
        assert_eq!(rolling_hash("abc"), 96354);
        assert_eq!(rolling_hash(""), 0);
    }

    #[test]
    fn base36_encoding() {
        assert_eq!(base36(0), "0");
        assert_eq!(base36(35), "z");
        assert_eq!(base36(36), "10");
        assert_eq!(base36(96354), "22ci");
    }

    #[test]
    fn ua_classification() {
        let d = derive(DESKTOP_UA, None, "");
        assert_eq!(d.platform, "Windows");
        assert_eq!(d.browser, "Chrome");
        assert_eq!(d.kind, DeviceKind::Desktop);
        assert_eq!(d.default_name, "Chrome on Windows");

        let i = derive(IPHONE_UA, None, "");
        assert_eq!(i.platform, "iOS");
        assert_eq!(i.browser, "Safari");
        assert_eq!(i.kind, DeviceKind::Mobile);
    }
}
