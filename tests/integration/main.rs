//! Integration tests for kiln

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn kiln() -> Command {
        let mut cmd = cargo_bin_cmd!("kiln");
        cmd.env_remove("KILN_CONFIG");
        cmd
    }

    /// A config file pointing the registry into the temp dir
    fn config_in(dir: &Path) -> String {
        let path = dir.join("config.toml");
        fs::write(
            &path,
            format!("[registry]\npath = {:?}\n", dir.join("registry").display().to_string()),
        )
        .unwrap();
        path.display().to_string()
    }

    fn static_site(dir: &Path) -> String {
        let site = dir.join("site");
        fs::create_dir_all(&site).unwrap();
        fs::write(site.join("index.html"), "<h1>hello</h1>").unwrap();
        site.display().to_string()
    }

    #[test]
    fn help_displays() {
        kiln()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("layer-cached image builder"));
    }

    #[test]
    fn version_displays() {
        kiln()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("kiln"));
    }

    #[test]
    fn config_path_honors_flag() {
        let temp = TempDir::new().unwrap();
        let config = config_in(temp.path());
        kiln()
            .args(["--config", &config, "config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let temp = TempDir::new().unwrap();
        let config = config_in(temp.path());
        kiln()
            .args(["--config", &config, "config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[cache]"))
            .stdout(predicate::str::contains("ttl_days = 7"));
    }

    #[test]
    fn config_set_then_show() {
        let temp = TempDir::new().unwrap();
        let config = config_in(temp.path());
        kiln()
            .args(["--config", &config, "config", "set", "cache.ttl_days", "21"])
            .assert()
            .success();
        kiln()
            .args(["--config", &config, "config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("ttl_days = 21"));
    }

    #[test]
    fn config_set_rejects_bad_value() {
        let temp = TempDir::new().unwrap();
        let config = config_in(temp.path());
        kiln()
            .args(["--config", &config, "config", "set", "cache.ttl_days", "soon"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }

    #[test]
    fn completions_bash() {
        kiln()
            .args(["completions", "bash"])
            .assert()
            .success()
            .stdout(predicate::str::contains("kiln"));
    }

    #[test]
    fn build_missing_context_is_user_error() {
        let temp = TempDir::new().unwrap();
        let config = config_in(temp.path());
        kiln()
            .args(["--config", &config, "build", "/definitely/not/here", "--target", "app:v1"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Build context not found"))
            .stderr(predicate::str::contains("Hint:"));
    }

    #[test]
    fn build_static_site_is_reproducible() {
        let temp = TempDir::new().unwrap();
        let config = config_in(temp.path());
        let site = static_site(temp.path());

        let first = kiln()
            .args(["--config", &config, "build", &site, "--target", "site:v1", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::starts_with("sha256:"))
            .get_output()
            .stdout
            .clone();
        let second = kiln()
            .args(["--config", &config, "build", &site, "--target", "site:v2", "--format", "plain"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        assert_eq!(first, second);
        assert!(temp.path().join("registry/repositories/site/tags/v1").exists());
    }

    #[test]
    fn build_json_report() {
        let temp = TempDir::new().unwrap();
        let config = config_in(temp.path());
        let site = static_site(temp.path());

        kiln()
            .args(["--config", &config, "build", &site, "--target", "site:v1", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"session_id\""))
            .stdout(predicate::str::contains("\"source\": \"built\""));
    }

    #[test]
    fn build_tarball_output() {
        let temp = TempDir::new().unwrap();
        let config = config_in(temp.path());
        let site = static_site(temp.path());
        let tarball = temp.path().join("site.tar");

        kiln()
            .args(["--config", &config, "build", &site, "--target", "site:v1", "--format", "plain"])
            .arg("--tarball")
            .arg(&tarball)
            .assert()
            .success();

        let mut archive = tar::Archive::new(fs::File::open(&tarball).unwrap());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert!(names.contains(&"oci-layout".to_string()));
        assert!(names.contains(&"index.json".to_string()));
        assert!(!temp.path().join("registry/repositories/site").exists());
    }

    #[test]
    fn cache_list_empty() {
        let temp = TempDir::new().unwrap();
        let config = config_in(temp.path());
        kiln()
            .args(["--config", &config, "cache", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No cache entries"));
    }

    #[test]
    fn cache_gc_nothing_to_remove() {
        let temp = TempDir::new().unwrap();
        let config = config_in(temp.path());
        kiln()
            .args(["--config", &config, "cache", "gc", "--dry-run"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No cache entries older than 7 days"));
    }
}

mod pipeline_tests {
    use async_trait::async_trait;
    use chrono::Duration;
    use kiln::builder::{BuildTool, ToolInvocation, ToolOutput};
    use kiln::cache::CacheStore;
    use kiln::image::Image;
    use kiln::orchestrator::{BuildOptions, BuildSession, LayerSource};
    use kiln::registry::{ImageRef, MemoryRegistry, Registry};
    use kiln::{KilnError, KilnResult};
    use std::collections::BTreeSet;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// Stands in for python/pip and npm: installs write a marker file,
    /// `pip wheel` drops the configured wheels, listed arguments or wheel
    /// files fail.
    #[derive(Default)]
    struct FakeInstaller {
        wheels: Vec<&'static str>,
        failing: Vec<&'static str>,
        calls: Mutex<Vec<ToolInvocation>>,
    }

    impl FakeInstaller {
        fn installs(&self) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.args.iter().any(|a| a == "install" || a == "venv"))
                .count()
        }
    }

    fn install_dir(inv: &ToolInvocation) -> PathBuf {
        match (inv.flag_value("--root"), inv.flag_value("--prefix")) {
            (Some(root), Some(prefix)) => PathBuf::from(root).join(prefix.trim_start_matches('/')),
            (None, Some(prefix)) => PathBuf::from(prefix),
            _ => inv.cwd.clone(),
        }
    }

    #[async_trait]
    impl BuildTool for FakeInstaller {
        async fn run(&self, inv: &ToolInvocation) -> KilnResult<ToolOutput> {
            self.calls.lock().unwrap().push(inv.clone());
            let fails = |a: &String| {
                self.failing
                    .iter()
                    .any(|f| a.as_str() == *f || a.ends_with(&format!("/{}", f)))
            };
            if inv.args.iter().any(fails) {
                return Ok(ToolOutput {
                    code: 1,
                    stderr: "ERROR: No matching distribution found".to_string(),
                    ..Default::default()
                });
            }
            if let Some(wheels) = inv.flag_value("-w") {
                for wheel in &self.wheels {
                    fs::write(PathBuf::from(wheels).join(wheel), b"").unwrap();
                }
                return Ok(ToolOutput::default());
            }
            let target = install_dir(inv);
            fs::create_dir_all(&target).unwrap();
            fs::write(target.join("installed.txt"), inv.command_line()).unwrap();
            Ok(ToolOutput::default())
        }
    }

    /// Delegates to memory, but every cache repository is unreachable
    #[derive(Default)]
    struct CacheOutage {
        inner: MemoryRegistry,
    }

    impl CacheOutage {
        fn check(repository: &str) -> KilnResult<()> {
            if repository.contains("/cache") {
                return Err(KilnError::Registry("connection refused".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Registry for CacheOutage {
        async fn exists(&self, reference: &ImageRef) -> KilnResult<bool> {
            Self::check(&reference.repository)?;
            self.inner.exists(reference).await
        }

        async fn pull(&self, reference: &ImageRef) -> KilnResult<Image> {
            Self::check(&reference.repository)?;
            self.inner.pull(reference).await
        }

        async fn push(&self, reference: &ImageRef, image: &Image) -> KilnResult<String> {
            Self::check(&reference.repository)?;
            self.inner.push(reference, image).await
        }

        async fn tags(&self, repository: &str) -> KilnResult<BTreeSet<String>> {
            Self::check(repository)?;
            self.inner.tags(repository).await
        }

        async fn delete(&self, reference: &ImageRef) -> KilnResult<()> {
            Self::check(&reference.repository)?;
            self.inner.delete(reference).await
        }

        fn registry_name(&self) -> &'static str {
            "cache-outage"
        }
    }

    fn flask_app() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("requirements.txt"), "flask==0.12.0\n").unwrap();
        fs::write(dir.path().join("app.py"), "from flask import Flask\n").unwrap();
        dir
    }

    fn options(dir: &TempDir) -> BuildOptions {
        BuildOptions::new(ImageRef::parse("team/flask:v1").unwrap(), dir.path())
    }

    #[tokio::test]
    async fn flask_rebuild_hits_cache() {
        let app = flask_app();
        let registry = Arc::new(MemoryRegistry::new());
        let tool = Arc::new(FakeInstaller::default());

        let first = BuildSession::new(options(&app), registry.clone(), tool.clone())
            .unwrap()
            .run()
            .await
            .unwrap();
        let names: Vec<&str> = first.layers.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["interpreter", "dependencies", "app"]);
        assert_eq!(first.builds, 2);
        assert_eq!(first.stores, 2);

        let cache = CacheStore::new(registry.clone(), "team/flask/cache", Duration::days(7));
        let entries = cache
            .list(&["python-dependencies".to_string()])
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);

        let installs = tool.installs();
        let second = BuildSession::new(options(&app), registry, tool.clone())
            .unwrap()
            .run()
            .await
            .unwrap();
        assert_eq!(second.builds, 0);
        assert_eq!(second.stores, 0);
        assert_eq!(second.cache_hits, 2);
        assert_eq!(tool.installs(), installs);
        assert_eq!(first.digest, second.digest);
    }

    #[tokio::test]
    async fn changed_requirements_rebuild_only_dependencies() {
        let app = flask_app();
        let registry = Arc::new(MemoryRegistry::new());
        let tool = Arc::new(FakeInstaller::default());

        BuildSession::new(options(&app), registry.clone(), tool.clone())
            .unwrap()
            .run()
            .await
            .unwrap();
        fs::write(app.path().join("requirements.txt"), "flask==1.0.2\n").unwrap();

        let report = BuildSession::new(options(&app), registry, tool)
            .unwrap()
            .run()
            .await
            .unwrap();
        let sources: Vec<LayerSource> = report.layers.iter().map(|l| l.source).collect();
        assert_eq!(
            sources,
            vec![LayerSource::Cached, LayerSource::Built, LayerSource::Built]
        );
        assert_eq!(report.builds, 1);
    }

    #[tokio::test]
    async fn expired_entries_are_rebuilt() {
        let app = flask_app();
        let registry = Arc::new(MemoryRegistry::new());
        let tool = Arc::new(FakeInstaller::default());
        let mut opts = options(&app);
        opts.ttl = Duration::zero();

        BuildSession::new(opts.clone(), registry.clone(), tool.clone())
            .unwrap()
            .run()
            .await
            .unwrap();
        let report = BuildSession::new(opts, registry, tool)
            .unwrap()
            .run()
            .await
            .unwrap();
        assert_eq!(report.cache_hits, 0);
        assert_eq!(report.builds, 2);
        assert_eq!(report.stores, 2);
    }

    #[tokio::test]
    async fn cache_outage_degrades_to_full_build() {
        let app = flask_app();
        let registry = Arc::new(CacheOutage::default());
        let tool = Arc::new(FakeInstaller::default());

        let report = BuildSession::new(options(&app), registry.clone(), tool)
            .unwrap()
            .run()
            .await
            .unwrap();
        assert_eq!(report.builds, 2);
        assert_eq!(report.stores, 0);

        let image = registry
            .pull(&ImageRef::parse("team/flask:v1").unwrap())
            .await
            .unwrap();
        assert_eq!(image.digest().unwrap(), report.digest);
    }

    #[tokio::test]
    async fn per_package_failure_stores_nothing() {
        let app = flask_app();
        let registry = Arc::new(MemoryRegistry::new());
        let tool = Arc::new(FakeInstaller {
            wheels: vec!["Flask-0.12.0-py2.py3-none-any.whl", "Werkzeug-0.14.1-py2.py3-none-any.whl"],
            failing: vec!["Werkzeug-0.14.1-py2.py3-none-any.whl"],
            ..Default::default()
        });
        let mut opts = options(&app);
        opts.per_package = true;
        opts.jobs = 2;

        let err = BuildSession::new(opts, registry.clone(), tool)
            .unwrap()
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::ToolFailed { .. }));
        assert!(err.is_user_error());
        assert_eq!(registry.push_count(), 0);
    }

    #[tokio::test]
    async fn per_package_layers_are_reused_individually() {
        let app = flask_app();
        let registry = Arc::new(MemoryRegistry::new());
        let tool = Arc::new(FakeInstaller {
            wheels: vec!["Werkzeug-0.14.1-py2.py3-none-any.whl", "Flask-0.12.0-py2.py3-none-any.whl"],
            ..Default::default()
        });
        let mut opts = options(&app);
        opts.per_package = true;

        let first = BuildSession::new(opts.clone(), registry.clone(), tool.clone())
            .unwrap()
            .run()
            .await
            .unwrap();
        let names: Vec<&str> = first.layers.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["interpreter", "flask==0.12.0", "werkzeug==0.14.1", "app"]
        );

        let second = BuildSession::new(opts, registry, tool)
            .unwrap()
            .run()
            .await
            .unwrap();
        assert_eq!(second.builds, 0);
        assert_eq!(first.digest, second.digest);
    }

    #[tokio::test]
    async fn node_hook_runs_before_layer_is_cut() {
        let app = TempDir::new().unwrap();
        fs::write(
            app.path().join("package.json"),
            r#"{"name":"web","scripts":{"prepare-image":"webpack"}}"#,
        )
        .unwrap();
        fs::write(app.path().join("package-lock.json"), r#"{"lockfileVersion":3,"packages":{}}"#)
            .unwrap();
        fs::write(app.path().join("server.js"), "require('http')\n").unwrap();
        let registry = Arc::new(MemoryRegistry::new());
        let tool = Arc::new(FakeInstaller::default());

        let mut opts = BuildOptions::new(ImageRef::parse("team/web:v1").unwrap(), app.path());
        opts.entrypoint = Some(vec!["node".to_string(), "server.js".to_string()]);
        let report = BuildSession::new(opts, registry.clone(), tool.clone())
            .unwrap()
            .run()
            .await
            .unwrap();

        let names: Vec<&str> = report.layers.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["dependencies", "app"]);
        let calls = tool.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 3);
        assert!(!calls[0].args.contains(&"--production".to_string()));
        assert_eq!(calls[1].args, vec!["run-script", "prepare-image"]);
        assert_eq!(calls[1].env.get("NODE_ENV").map(String::as_str), Some("development"));
        assert!(calls[2].args.contains(&"--production".to_string()));
        assert!(calls[2].env.get("NODE_ENV").is_none());

        let image = registry
            .pull(&ImageRef::parse("team/web:v1").unwrap())
            .await
            .unwrap();
        assert_eq!(
            image.config().config.entrypoint,
            Some(vec!["node".to_string(), "server.js".to_string()])
        );
    }
}
