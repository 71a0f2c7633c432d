//! Image assembly
//!
//! Appends layers onto a base image. Each append yields a new image; the base
//! is never mutated. Walking the resulting layer list reproduces the appended
//! sequence exactly, so extracting the tarballs in order rebuilds the
//! filesystem with later layers masking earlier ones.

use crate::image::{History, Image};
use crate::layer::{Layer, LayerOverrides};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Append `layer` to `base`, merging `overrides` into the config.
///
/// Entrypoint, cmd, exposed ports and working dir are replaced when set.
/// Environment variables merge by key; the later value wins and new keys
/// are appended after the inherited ones.
pub fn append(base: &Image, layer: Arc<Layer>, overrides: &LayerOverrides, created_by: &str) -> Image {
    let mut image = base.clone();
    debug!(diff_id = %layer.diff_id(), created_by, "appending layer");

    let created = overrides.created.unwrap_or(image.config().created);
    image.push_layer(layer);

    let config = image.config_mut();
    config.created = created;
    config.history.push(History {
        created,
        created_by: created_by.to_string(),
    });

    let runtime = &mut config.config;
    merge_env(&mut runtime.env, &overrides.env);

    if let Some(ref entrypoint) = overrides.entrypoint {
        runtime.entrypoint = Some(entrypoint.clone());
    }
    if let Some(ref cmd) = overrides.cmd {
        runtime.cmd = Some(cmd.clone());
    }
    if let Some(ref ports) = overrides.exposed_ports {
        runtime.exposed_ports = Some(exposed_ports(ports));
    }
    if let Some(ref dir) = overrides.working_dir {
        runtime.working_dir = Some(dir.clone());
    }

    image
}

/// Append every layer in order, each with the overrides it carries
pub fn compose<'a, I>(base: &Image, layers: I) -> Image
where
    I: IntoIterator<Item = (&'a str, &'a Arc<Layer>)>,
{
    layers.into_iter().fold(base.clone(), |image, (name, layer)| {
        append(&image, layer.clone(), layer.overrides(), name)
    })
}

/// Merge `KEY=VALUE` entries in place. Existing keys keep their position.
fn merge_env(env: &mut Vec<String>, overrides: &BTreeMap<String, String>) {
    for (key, value) in overrides {
        let entry = format!("{}={}", key, value);
        match env
            .iter_mut()
            .find(|kv| kv.split_once('=').map(|(k, _)| k) == Some(key.as_str()))
        {
            Some(existing) => *existing = entry,
            None => env.push(entry),
        }
    }
}

/// Normalize ports to the `port/proto` keys used by the config format
fn exposed_ports(ports: &[String]) -> BTreeMap<String, serde_json::Value> {
    ports
        .iter()
        .map(|p| {
            let key = if p.contains('/') {
                p.clone()
            } else {
                format!("{}/tcp", p)
            };
            (key, serde_json::json!({}))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::LayerArchive;
    use chrono::{TimeZone, Utc};

    fn layer(name: &str, overrides: LayerOverrides) -> Arc<Layer> {
        let mut archive = LayerArchive::new();
        archive.append_file(name, name.as_bytes(), 0o644).unwrap();
        Arc::new(Layer::from_tar(&archive.finish().unwrap(), overrides).unwrap())
    }

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn layer_walk_preserves_order() {
        let l1 = layer("one", LayerOverrides::default());
        let l2 = layer("two", LayerOverrides::default());
        let l3 = layer("three", LayerOverrides::default());

        let image = compose(
            &Image::scratch(),
            [("one", &l1), ("two", &l2), ("three", &l3)],
        );

        let walked: Vec<&str> = image.layers().iter().map(|l| l.diff_id()).collect();
        assert_eq!(walked, vec![l1.diff_id(), l2.diff_id(), l3.diff_id()]);
        assert_eq!(image.diff_ids(), walked.as_slice());
        assert_eq!(image.config().history.len(), 3);
        assert_eq!(image.config().history[1].created_by, "two");
    }

    #[test]
    fn append_does_not_mutate_base() {
        let base = Image::scratch();
        let image = append(&base, layer("a", LayerOverrides::default()), &LayerOverrides::default(), "a");
        assert!(base.layers().is_empty());
        assert_eq!(image.layers().len(), 1);
    }

    #[test]
    fn later_overrides_win() {
        let first = LayerOverrides {
            entrypoint: Some(vec!["python".into()]),
            exposed_ports: Some(vec!["8080".into()]),
            env: env(&[("PATH", "/env/bin:/usr/bin"), ("VIRTUAL_ENV", "/env")]),
            ..Default::default()
        };
        let second = LayerOverrides {
            entrypoint: Some(vec!["gunicorn".into(), "app:app".into()]),
            env: env(&[("PORT", "8080"), ("VIRTUAL_ENV", "/venv")]),
            ..Default::default()
        };

        let image = append(&Image::scratch(), layer("a", first.clone()), &first, "a");
        let image = append(&image, layer("b", second.clone()), &second, "b");
        let runtime = &image.config().config;

        assert_eq!(
            runtime.entrypoint,
            Some(vec!["gunicorn".to_string(), "app:app".to_string()])
        );
        assert!(runtime.exposed_ports.as_ref().unwrap().contains_key("8080/tcp"));
        assert_eq!(runtime.env_var("VIRTUAL_ENV"), Some("/venv"));
        assert_eq!(runtime.env_var("PATH"), Some("/env/bin:/usr/bin"));
        assert_eq!(runtime.env_var("PORT"), Some("8080"));
        assert_eq!(runtime.env[0], "PATH=/env/bin:/usr/bin");
    }

    #[test]
    fn created_override_applies() {
        let when = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        let overrides = LayerOverrides {
            created: Some(when),
            ..Default::default()
        };
        let image = append(&Image::scratch(), layer("a", LayerOverrides::default()), &overrides, "a");
        assert_eq!(image.created(), when);
        assert_eq!(image.config().history[0].created, when);
    }

    #[test]
    fn port_protocols_preserved() {
        let ports = exposed_ports(&["53/udp".to_string(), "80".to_string()]);
        let keys: Vec<&String> = ports.keys().collect();
        assert_eq!(keys, vec!["53/udp", "80/tcp"]);
    }
}
