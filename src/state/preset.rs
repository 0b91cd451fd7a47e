//! User preset bundles.
//!
//! A preset captures one module's control-port values and opaque plugin
//! state into a small bundle directory under the user data dir
//! (`$XDG_DATA_HOME/synthpod/presets/<plugin>/<label>.preset.synthpod/`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::turtle::{self, Obj, Term, Writer};
use super::{PSET, RDFS, XSD, from_hex, spod, to_hex, xsd};
use crate::error::{Error, Result};
use crate::plugin::host::StateProp;
use crate::plugin::types::PresetInfo;
use crate::urid::UridMap;

/// One loaded preset.
#[derive(Debug, Clone, PartialEq)]
pub struct PresetData {
    pub label: String,
    pub plugin_uri: String,
    pub port_values: Vec<(String, f32)>,
    pub state: Vec<StateProp>,
}

pub struct PresetStore {
    root: PathBuf,
}

impl PresetStore {
    /// Store rooted at the user data dir.
    pub fn new() -> Self {
        let root = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("synthpod")
            .join("presets");
        PresetStore { root }
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        PresetStore { root: root.into() }
    }

    fn plugin_dir(&self, plugin_uri: &str) -> PathBuf {
        self.root.join(sanitize(plugin_uri))
    }

    fn bundle_dir(&self, plugin_uri: &str, label: &str) -> PathBuf {
        self.plugin_dir(plugin_uri)
            .join(format!("{}.preset.synthpod", sanitize(label)))
    }

    /// Persist a preset; overwrites an existing one with the same label.
    pub fn save(
        &self,
        plugin_uri: &str,
        label: &str,
        port_values: &[(String, f32)],
        state: &[StateProp],
        urid: &Arc<UridMap>,
    ) -> Result<PresetInfo> {
        let dir = self.bundle_dir(plugin_uri, label);
        std::fs::create_dir_all(&dir)?;

        let mut manifest = Writer::new()
            .prefix("pset", PSET)
            .prefix("rdfs", RDFS);
        manifest
            .subject(&Term::iri("state.ttl"))
            .type_(&format!("{PSET}Preset"))
            .prop(&format!("{RDFS}seeAlso"), Obj::iri("state.ttl"))
            .end();
        std::fs::write(dir.join("manifest.ttl"), manifest.finish())?;

        let mut w = Writer::new()
            .prefix("lv2", super::LV2)
            .prefix("pset", PSET)
            .prefix("rdfs", RDFS)
            .prefix("spod", super::SPOD)
            .prefix("xsd", XSD);
        let mut subject = w
            .subject(&Term::iri(""))
            .type_(&format!("{PSET}Preset"))
            .prop(&format!("{RDFS}label"), Obj::plain(label))
            .prop(&format!("{}appliesTo", super::LV2), Obj::iri(plugin_uri));

        for (symbol, value) in port_values {
            subject = subject.prop(
                &format!("{}port", super::LV2),
                Obj::node(vec![
                    (format!("{}symbol", super::LV2), Obj::plain(symbol.clone())),
                    (
                        format!("{PSET}value"),
                        Obj::typed(format!("{value}"), xsd("float")),
                    ),
                ]),
            );
        }

        for prop in state {
            let Some(key_uri) = urid.unmap(prop.key) else {
                continue;
            };
            let type_uri = urid.unmap(prop.type_urid).unwrap_or_default();
            subject = subject.prop(
                &spod("stateProperty"),
                Obj::node(vec![
                    (spod("stateKey"), Obj::iri(key_uri)),
                    (spod("stateType"), Obj::iri(type_uri)),
                    (
                        spod("stateFlags"),
                        Obj::typed(format!("{}", prop.flags), xsd("int")),
                    ),
                    (
                        spod("stateValue"),
                        Obj::typed(to_hex(&prop.value), xsd("hexBinary")),
                    ),
                ]),
            );
        }
        subject.end();
        std::fs::write(dir.join("state.ttl"), w.finish())?;

        Ok(PresetInfo {
            uri: format!("file://{}", dir.display()),
            label: label.to_string(),
            bundle: dir.display().to_string(),
        })
    }

    /// All presets stored for a plugin.
    pub fn list(&self, plugin_uri: &str) -> Vec<PresetInfo> {
        let dir = self.plugin_dir(plugin_uri);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if let Ok(data) = self.load_dir(&path, None) {
                out.push(PresetInfo {
                    uri: format!("file://{}", path.display()),
                    label: data.label,
                    bundle: path.display().to_string(),
                });
            }
        }
        out.sort_by(|a, b| a.label.cmp(&b.label));
        out
    }

    /// Load a preset by its `file://` URI.
    pub fn load(&self, preset_uri: &str, urid: &Arc<UridMap>) -> Result<PresetData> {
        let path = preset_uri
            .strip_prefix("file://")
            .ok_or_else(|| Error::lookup(format!("not a preset bundle URI: {preset_uri}")))?;
        self.load_dir(Path::new(path), Some(urid))
    }

    fn load_dir(&self, dir: &Path, urid: Option<&Arc<UridMap>>) -> Result<PresetData> {
        let text = std::fs::read_to_string(dir.join("state.ttl"))
            .map_err(|e| Error::resource(format!("{}: {e}", dir.display())))?;
        let doc = turtle::parse(&text)?;
        let subject = Term::iri("");

        let label = doc
            .object(&subject, &format!("{RDFS}label"))
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();
        let plugin_uri = doc
            .object(&subject, &format!("{}appliesTo", super::LV2))
            .and_then(|t| t.as_iri())
            .unwrap_or_default()
            .to_string();

        let mut port_values = Vec::new();
        for port in doc.objects(&subject, &format!("{}port", super::LV2)) {
            let symbol = doc
                .object(port, &format!("{}symbol", super::LV2))
                .and_then(|t| t.as_str());
            let value = doc
                .object(port, &format!("{PSET}value"))
                .and_then(|t| t.as_f32());
            if let (Some(symbol), Some(value)) = (symbol, value) {
                port_values.push((symbol.to_string(), value));
            }
        }

        let mut state = Vec::new();
        if let Some(urid) = urid {
            for node in doc.objects(&subject, &spod("stateProperty")) {
                let key = doc
                    .object(node, &spod("stateKey"))
                    .and_then(|t| t.as_iri())
                    .map(|iri| urid.map(iri));
                let type_urid = doc
                    .object(node, &spod("stateType"))
                    .and_then(|t| t.as_iri())
                    .map(|iri| urid.map(iri))
                    .unwrap_or(0);
                let flags = doc
                    .object(node, &spod("stateFlags"))
                    .and_then(|t| t.as_i32())
                    .unwrap_or(0) as u32;
                let value = doc
                    .object(node, &spod("stateValue"))
                    .and_then(|t| t.as_str())
                    .and_then(from_hex);
                if let (Some(key), Some(value)) = (key, value) {
                    state.push(StateProp {
                        key,
                        type_urid,
                        flags,
                        value,
                    });
                }
            }
        }

        Ok(PresetData {
            label,
            plugin_uri,
            port_values,
            state,
        })
    }
}

impl Default for PresetStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Filesystem-safe name from a URI or label.
fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_list_load_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PresetStore::with_root(tmp.path());
        let urid = UridMap::new();

        let state = vec![StateProp {
            key: urid.map("http://example.org/amp#memory"),
            type_urid: urid.map("http://lv2plug.in/ns/ext/atom#Chunk"),
            flags: 3,
            value: vec![1, 2, 3, 254],
        }];
        let info = store
            .save(
                "http://example.org/amp",
                "Warm Lead",
                &[("freq".to_string(), 220.0), ("gain".to_string(), 0.5)],
                &state,
                &urid,
            )
            .unwrap();
        assert_eq!(info.label, "Warm Lead");

        let listed = store.list("http://example.org/amp");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].label, "Warm Lead");

        let data = store.load(&info.uri, &urid).unwrap();
        assert_eq!(data.plugin_uri, "http://example.org/amp");
        assert!(data.port_values.contains(&("freq".to_string(), 220.0)));
        assert_eq!(data.state, state);
    }

    #[test]
    fn listing_unknown_plugin_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PresetStore::with_root(tmp.path());
        assert!(store.list("http://example.org/none").is_empty());
    }
}
