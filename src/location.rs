use crate::errors::{MeridianError, Result};
use serde::{Deserialize, Serialize};
use url::Url;

/// A resolvable resource reference.
///
/// `href` is always recomposed from the decomposed parts before it is written,
/// so the two can never diverge in storage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub href: String,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub search: Option<String>,
    /// Group names gating access. `None` means the no-group scopes apply.
    #[serde(default)]
    pub auth: Option<Vec<String>>,
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<Box<Entity>>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub cache_expire_in: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

/// Fields that identify the same lookup even when they differ between copies.
pub const VOLATILE_FIELDS: &[&str] = &[
    "id",
    "created_at",
    "updated_at",
    "entity",
    "entity_id",
    "expires_at",
    "cache_expire_in",
];

impl Location {
    pub fn from_href(href: &str) -> Result<Self> {
        let mut location = Location {
            href: href.to_string(),
            ..Default::default()
        };
        location.decompose()?;
        location.href = location.compose_href();
        Ok(location)
    }

    /// Fill the URL parts from `href`.
    pub fn decompose(&mut self) -> Result<()> {
        if self.href.is_empty() {
            return Err(MeridianError::MalformedRequest(
                "location href is required".to_string(),
            ));
        }

        match Url::parse(&self.href) {
            Ok(url) => {
                self.protocol = Some(url.scheme().to_string());
                self.host = url.host_str().map(str::to_string);
                self.port = url.port();
                self.path = url.path().to_string();
                self.search = url.query().map(str::to_string);
                self.hash = url.fragment().map(str::to_string);
            }
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let base = Url::parse("relative://base/")
                    .map_err(|e| MeridianError::Other(e.to_string()))?;
                let url = base.join(&self.href).map_err(|e| {
                    MeridianError::MalformedRequest(format!("bad href `{}`: {e}", self.href))
                })?;
                self.protocol = None;
                self.host = None;
                self.port = None;
                self.path = url.path().to_string();
                self.search = url.query().map(str::to_string);
                self.hash = url.fragment().map(str::to_string);
            }
            Err(e) => {
                return Err(MeridianError::MalformedRequest(format!(
                    "bad href `{}`: {e}",
                    self.href
                )))
            }
        }
        Ok(())
    }

    pub fn compose_href(&self) -> String {
        let mut href = String::new();
        if let Some(protocol) = &self.protocol {
            href.push_str(protocol);
            href.push(':');
            if let Some(host) = &self.host {
                href.push_str("//");
                href.push_str(host);
                if let Some(port) = self.port {
                    href.push(':');
                    href.push_str(&port.to_string());
                }
            }
        }
        href.push_str(&self.path);
        if let Some(search) = self.search.as_deref().filter(|s| !s.is_empty()) {
            href.push('?');
            href.push_str(search);
        }
        if let Some(hash) = self.hash.as_deref().filter(|s| !s.is_empty()) {
            href.push('#');
            href.push_str(hash);
        }
        href
    }

    /// Bring parts and `href` into agreement before a write. Parts win when present.
    pub fn canonicalize(&mut self) -> Result<()> {
        if self.path.is_empty() && self.host.is_none() {
            self.decompose()?;
        }
        self.href = self.compose_href();
        Ok(())
    }

    /// The lookup identity of this location, with every volatile field removed.
    pub fn lookup_view(&self) -> Result<serde_json::Value> {
        let mut value = serde_json::to_value(self)?;
        if let Some(map) = value.as_object_mut() {
            for field in VOLATILE_FIELDS {
                map.remove(*field);
            }
        }
        Ok(value)
    }

    pub fn groups(&self) -> &[String] {
        self.auth.as_deref().unwrap_or(&[])
    }
}

/// The materialized resource behind a location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub source_href: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Box<Location>>,
    #[serde(flatten)]
    pub kind: EntityKind,
    #[serde(default)]
    pub user: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EntityKind {
    Redirect {
        target: Option<String>,
        #[serde(default)]
        permanent: bool,
    },
    Mirror {
        /// Hrefs of the mirror locations, tried in order
        mirrors: Vec<String>,
    },
    S3 {
        bucket: String,
        key: String,
    },
    Ipfs {
        cid: String,
        #[serde(default)]
        pinned: bool,
    },
    Identity {
        provider: String,
        provider_user_id: String,
    },
}

impl EntityKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            EntityKind::Redirect { .. } => "Redirect",
            EntityKind::Mirror { .. } => "Mirror",
            EntityKind::S3 { .. } => "S3",
            EntityKind::Ipfs { .. } => "Ipfs",
            EntityKind::Identity { .. } => "Identity",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_absolute_href() {
        let location = Location::from_href("http://x:8080/y/z?a=1#frag").expect("parse");

        assert_eq!(location.protocol.as_deref(), Some("http"));
        assert_eq!(location.host.as_deref(), Some("x"));
        assert_eq!(location.port, Some(8080));
        assert_eq!(location.path, "/y/z");
        assert_eq!(location.search.as_deref(), Some("a=1"));
        assert_eq!(location.hash.as_deref(), Some("frag"));
        assert_eq!(location.href, "http://x:8080/y/z?a=1#frag");
    }

    #[test]
    fn test_from_relative_href() {
        let location = Location::from_href("/a/b?c=d").expect("parse");

        assert!(location.protocol.is_none());
        assert!(location.host.is_none());
        assert_eq!(location.path, "/a/b");
        assert_eq!(location.href, "/a/b?c=d");
    }

    #[test]
    fn test_canonicalize_prefers_parts() {
        let mut location = Location::from_href("http://x/y").expect("parse");
        location.path = "/moved".to_string();
        location.canonicalize().expect("canonicalize");

        assert_eq!(location.href, "http://x/moved");
    }

    #[test]
    fn test_canonicalize_fills_parts_from_href() {
        let mut location = Location {
            href: "https://example.com/file.txt".to_string(),
            ..Default::default()
        };
        location.canonicalize().expect("canonicalize");

        assert_eq!(location.host.as_deref(), Some("example.com"));
        assert_eq!(location.path, "/file.txt");
    }

    #[test]
    fn test_empty_href_is_malformed() {
        assert!(matches!(
            Location::from_href(""),
            Err(MeridianError::MalformedRequest(_))
        ));
    }

    #[test]
    fn test_lookup_view_ignores_volatile_fields() {
        let mut a = Location::from_href("http://x/y").expect("parse");
        let mut b = a.clone();
        a.id = Some("one".to_string());
        a.created_at = Some(1);
        b.id = Some("two".to_string());
        b.cache_expire_in = Some(30);

        assert_eq!(a.lookup_view().unwrap(), b.lookup_view().unwrap());

        b.driver = Some("Redirect".to_string());
        assert_ne!(a.lookup_view().unwrap(), b.lookup_view().unwrap());
    }

    #[test]
    fn test_entity_kind_serialization() {
        let kind = EntityKind::Redirect {
            target: Some("http://elsewhere/".to_string()),
            permanent: false,
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "Redirect");
        assert_eq!(json["data"]["target"], "http://elsewhere/");
        assert_eq!(kind.type_name(), "Redirect");
    }
}
