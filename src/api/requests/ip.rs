use crate::api::Request;
use serde::de::{Error, IgnoredAny, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::borrow::Cow;
use std::fmt::Formatter;

/// What the server knows about the client's address.
///
/// Servers answer either with an ipinfo-style JSON object or with the bare
/// address as plain text.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IpInfo {
    pub ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

impl IpInfo {
    pub fn new(ip: impl Into<String>) -> Self {
        Self { ip: ip.into(), ..Self::default() }
    }

    pub fn with_org(mut self, org: impl Into<String>) -> Self {
        self.org = Some(org.into());
        self
    }
}

pub struct IpRequest {
    pub path: String,
}

impl Request for IpRequest {
    type Response = IpInfo;

    fn endpoint(&self) -> Cow<'_, str> {
        self.path.as_str().into()
    }
}

impl<'de> Deserialize<'de> for IpInfo {
    fn deserialize<D>(deserializer: D) -> Result<IpInfo, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(IpInfoVisitor)
    }
}

struct IpInfoVisitor;

impl<'de> Visitor<'de> for IpInfoVisitor {
    type Value = IpInfo;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("an IP address or an object with an `ip` field")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: Error,
    {
        let ip = v.trim();
        if ip.is_empty() {
            return Err(E::custom("empty IP address"));
        }

        Ok(IpInfo::new(ip))
    }

    fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut info = IpInfo::default();
        let mut has_ip = false;

        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "ip" => {
                    info.ip = map.next_value()?;
                    has_ip = true;
                }
                "org" => info.org = map.next_value()?,
                "hostname" => info.hostname = map.next_value()?,
                "city" => info.city = map.next_value()?,
                "region" => info.region = map.next_value()?,
                "country" => info.country = map.next_value()?,
                _ => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }

        if !has_ip {
            return Err(A::Error::missing_field("ip"));
        }

        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipinfo_json() {
        let body = concat!(
            r#"{"ip":"203.0.113.7","hostname":"host.example","city":"Lyon","#,
            r#""org":"AS3215 Orange","readme":"https://ipinfo.io/missingauth"}"#
        );
        let info: IpInfo = serde_json::from_str(body).unwrap();

        assert_eq!(info.ip, "203.0.113.7");
        assert_eq!(info.org.as_deref(), Some("AS3215 Orange"));
        assert_eq!(info.city.as_deref(), Some("Lyon"));
        assert_eq!(info.region, None);
    }

    #[test]
    fn test_ip_only_json() {
        let info: IpInfo = serde_json::from_str(r#"{"ip":"::1"}"#).unwrap();
        assert_eq!(info, IpInfo::new("::1"));
    }

    #[test]
    fn test_plain_text_address() {
        let info: IpInfo = serde_plain::from_str("198.51.100.4").unwrap();
        assert_eq!(info.ip, "198.51.100.4");
        assert_eq!(info.org, None);
    }

    #[test]
    fn test_missing_ip_is_rejected() {
        assert!(serde_json::from_str::<IpInfo>(r#"{"org":"x"}"#).is_err());
    }

    #[test]
    fn test_serialization_skips_unknown_fields() {
        let info = IpInfo::new("203.0.113.7").with_org("AS64500");
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"ip": "203.0.113.7", "org": "AS64500"})
        );
    }
}
