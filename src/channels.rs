use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Immutable channel record. `number` may be zero-padded ("05"); the
/// Resolver treats id and number as interchangeable lookup keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub number: String,
    pub display_name: String,
    pub match_terms: Vec<String>,
}

fn parse_extinf_attrs(line: &str) -> HashMap<String, String> {
    let re = Regex::new(r#"([a-zA-Z0-9\-]+)="([^"]*)""#).unwrap();
    re.captures_iter(line)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect()
}

/// Parses an M3U-like playlist into the static catalog, capturing
/// `tvg-id`/`tvg-chno` attributes and a trailing pipe-separated list of
/// alternate match terms.
///
/// Expected `#EXTINF` shape:
///   #EXTINF:0 tvg-id="NBC-E" tvg-chno="04",NBC East|NBC|Peacock
pub fn parse_m3u(content: &str) -> Result<Vec<Channel>> {
    let re_extinf = Regex::new(r"^#EXTINF:-?\d+(?P<attrs>.*?),(?P<rest>.*)$").unwrap();
    let mut channels = Vec::new();
    let mut pending: Option<(HashMap<String, String>, String, Vec<String>)> = None;

    for raw_line in content.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(caps) = re_extinf.captures(line) {
            let attrs = parse_extinf_attrs(&caps["attrs"]);
            let rest = caps["rest"].trim();
            let mut parts = rest.split('|');
            let display_name = parts.next().unwrap_or_default().trim().to_string();
            let match_terms: Vec<String> = parts.map(|s| s.trim().to_string()).collect();
            pending = Some((attrs, display_name, match_terms));
        } else if !line.starts_with('#') {
            if let Some((attrs, display_name, mut match_terms)) = pending.take() {
                let id = attrs
                    .get("tvg-id")
                    .cloned()
                    .unwrap_or_else(|| display_name.clone());
                let number = attrs.get("tvg-chno").cloned().unwrap_or_default();
                if match_terms.is_empty() {
                    match_terms.push(display_name.clone());
                }
                let _source_url = line; // stream source; not part of the Channel record
                channels.push(Channel {
                    id,
                    number,
                    display_name,
                    match_terms,
                });
            }
        }
    }

    Ok(channels)
}

/// Maps a requested channel identifier to matching criteria. Never performs
/// I/O beyond reading the two in-memory catalog caches it is constructed
/// with: a static catalog (by id) and a guide-sourced catalog (by number,
/// for locally-scoped channels).
#[derive(Clone)]
pub struct ChannelResolver {
    static_catalog: HashMap<String, Channel>,
    guide_catalog: std::sync::Arc<tokio::sync::RwLock<HashMap<String, Channel>>>,
}

impl ChannelResolver {
    pub fn new(
        static_catalog: Vec<Channel>,
        guide_catalog: std::sync::Arc<tokio::sync::RwLock<HashMap<String, Channel>>>,
    ) -> Self {
        Self {
            static_catalog: static_catalog.into_iter().map(|c| (c.id.clone(), c)).collect(),
            guide_catalog,
        }
    }

    pub async fn resolve(&self, id_or_number: &str) -> Option<Channel> {
        if let Some(channel) = self.static_catalog.get(id_or_number) {
            return Some(channel.clone());
        }
        let guide = self.guide_catalog.read().await;
        guide.get(id_or_number).cloned()
    }

    pub fn all(&self) -> Vec<Channel> {
        self.static_catalog.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_m3u() {
        let data = r#"#EXTM3U
#EXTINF:0 tvg-id="NBC-E" tvg-chno="04",NBC East|NBC|Peacock
rtsp://192.168.178.1:554/nbc
#EXTINF:0 tvg-id="CNN-E" tvg-chno="202",CNN East
rtsp://192.168.178.1:554/cnn"#;

        let channels = parse_m3u(data).unwrap();
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].id, "NBC-E");
        assert_eq!(channels[0].number, "04");
        assert_eq!(channels[0].display_name, "NBC East");
        assert_eq!(channels[0].match_terms, vec!["NBC", "Peacock"]);
        assert_eq!(channels[1].match_terms, vec!["CNN East"]);
    }

    #[tokio::test]
    async fn resolve_prefers_static_catalog_by_id() {
        let static_catalog = vec![Channel {
            id: "NBC-E".into(),
            number: "04".into(),
            display_name: "NBC East".into(),
            match_terms: vec!["NBC".into()],
        }];
        let guide = std::sync::Arc::new(tokio::sync::RwLock::new(HashMap::new()));
        let resolver = ChannelResolver::new(static_catalog, guide);

        let resolved = resolver.resolve("NBC-E").await.unwrap();
        assert_eq!(resolved.display_name, "NBC East");
        assert!(resolver.resolve("missing").await.is_none());
    }

    #[tokio::test]
    async fn resolve_falls_back_to_guide_catalog_by_number() {
        let guide = std::sync::Arc::new(tokio::sync::RwLock::new(HashMap::new()));
        {
            let mut g = guide.write().await;
            g.insert(
                "05".into(),
                Channel {
                    id: "LOCAL-05".into(),
                    number: "05".into(),
                    display_name: "Local Five".into(),
                    match_terms: vec!["Local Five".into()],
                },
            );
        }
        let resolver = ChannelResolver::new(vec![], guide);
        let resolved = resolver.resolve("05").await.unwrap();
        assert_eq!(resolved.id, "LOCAL-05");
    }
}
