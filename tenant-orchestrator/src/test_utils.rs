use crate::pipeline::{DeploymentPipeline, ToolSettings};
use crate::remote::shell_quote;
use crate::scheduler::TaskScheduler;
use crate::tenant::TenantStore;
use crate::workspace::{WorkspaceManager, WorkspaceSettings};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

/// Helper to create an in-memory test database with migrations applied.
/// A single long-lived connection keeps the database alive and visible to
/// background tasks.
pub async fn create_test_db() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// Outputs the fake tool reports by default. `db_password` is secret and
/// must never be persisted.
pub const DEFAULT_OUTPUTS_JSON: &str = r#"{
  "db_instance_name": {"sensitive": false, "type": "string", "value": "mysql-instance-dev"},
  "database_name": {"sensitive": false, "type": "string", "value": "tenant_db"},
  "private_bucket_name": {"sensitive": false, "type": "string", "value": "tenant-private"},
  "db_password": {"sensitive": true, "type": "string", "value": "hunter2"}
}"#;

/// What the fake tool does for one verb.
#[derive(Debug, Clone)]
pub enum FakeStep {
    /// Print to stdout and exit 0.
    Succeed(String),
    /// Print to stderr and exit 1.
    Fail(String),
}

impl FakeStep {
    fn body(&self, verb: &str) -> String {
        match self {
            FakeStep::Succeed(stdout) => {
                let mut body = String::new();
                if verb == "init" {
                    body.push_str("mkdir -p .terraform\n");
                }
                body.push_str(&format!("printf '%s\\n' {}\nexit 0", shell_quote(stdout)));
                body
            }
            FakeStep::Fail(stderr) => format!("printf '%s\\n' {} >&2\nexit 1", shell_quote(stderr)),
        }
    }
}

#[derive(Default)]
struct Script {
    steps: BTreeMap<String, FakeStep>,
    delays: BTreeMap<String, f64>,
    overrides: Vec<(String, String, FakeStep)>,
}

/// A shell script standing in for the infrastructure tool binary.
///
/// Every invocation appends `<verb> <workspace dir name>` to a call log, so
/// tests can assert which commands ran for which tenant.
pub struct FakeTool {
    dir: TempDir,
    script: Mutex<Script>,
}

impl Default for FakeTool {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTool {
    pub fn new() -> Self {
        let mut script = Script::default();
        for (verb, stdout) in [
            ("init", "Terraform has been successfully initialized!"),
            ("apply", "Apply complete!"),
            ("output", DEFAULT_OUTPUTS_JSON),
            ("destroy", "Destroy complete!"),
        ] {
            script
                .steps
                .insert(verb.to_string(), FakeStep::Succeed(stdout.to_string()));
        }

        let tool = Self {
            dir: TempDir::new().expect("Failed to create fake tool dir"),
            script: Mutex::new(script),
        };
        tool.write();
        tool
    }

    /// Replace the behavior of one verb for every tenant.
    pub fn on(self, verb: &str, step: FakeStep) -> Self {
        self.edit(|script| {
            script.steps.insert(verb.to_string(), step);
        });
        self
    }

    /// Sleep before running `verb`.
    pub fn delay(self, verb: &str, duration: Duration) -> Self {
        self.edit(|script| {
            script
                .delays
                .insert(verb.to_string(), duration.as_secs_f64());
        });
        self
    }

    /// Replace the behavior of one verb for a single tenant. Takes `&self`
    /// because tenant ids only exist once the store has created them.
    pub fn on_tenant(&self, verb: &str, tenant_id: &str, step: FakeStep) {
        self.edit(|script| {
            script
                .overrides
                .push((verb.to_string(), tenant_id.to_string(), step));
        });
    }

    pub fn binary(&self) -> String {
        self.script_path().display().to_string()
    }

    /// Every recorded invocation as `(verb, tenant_id)`.
    pub fn calls(&self) -> Vec<(String, String)> {
        std::fs::read_to_string(self.calls_path())
            .unwrap_or_default()
            .lines()
            .filter_map(|line| {
                let (verb, tenant) = line.split_once(' ')?;
                Some((verb.to_string(), tenant.to_string()))
            })
            .collect()
    }

    /// Verbs invoked for one tenant, in order.
    pub fn calls_for(&self, tenant_id: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(_, tenant)| tenant == tenant_id)
            .map(|(verb, _)| verb)
            .collect()
    }

    fn script_path(&self) -> PathBuf {
        self.dir.path().join("terraform")
    }

    fn calls_path(&self) -> PathBuf {
        self.dir.path().join("calls.log")
    }

    fn edit(&self, f: impl FnOnce(&mut Script)) {
        f(&mut self.script.lock().expect("fake tool lock poisoned"));
        self.write();
    }

    fn render(&self) -> String {
        let config = self.script.lock().expect("fake tool lock poisoned");
        let mut script = String::from("#!/bin/sh\ntenant=$(basename \"$(pwd -P)\")\n");
        script.push_str(&format!(
            "echo \"$1 $tenant\" >> {}\n",
            shell_quote(&self.calls_path().display().to_string())
        ));

        for (verb, secs) in &config.delays {
            script.push_str(&format!(
                "if [ \"$1\" = {} ]; then sleep {}; fi\n",
                shell_quote(verb),
                secs
            ));
        }

        for (verb, tenant, step) in &config.overrides {
            script.push_str(&format!(
                "if [ \"$1\" = {} ] && [ \"$tenant\" = {} ]; then\n{}\nfi\n",
                shell_quote(verb),
                shell_quote(tenant),
                step.body(verb)
            ));
        }

        script.push_str("case \"$1\" in\n");
        for (verb, step) in &config.steps {
            script.push_str(&format!("{})\n{}\n;;\n", verb, step.body(verb)));
        }
        script.push_str("esac\nexit 0\n");
        script
    }

    /// Write to a sibling file and rename over the script, so a concurrently
    /// running invocation never sees a half-written file.
    fn write(&self) {
        let path = self.script_path();
        let staging = self.dir.path().join("terraform.new");
        std::fs::write(&staging, self.render()).expect("Failed to write fake tool");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&staging, std::fs::Permissions::from_mode(0o755))
                .expect("Failed to make fake tool executable");
        }

        std::fs::rename(&staging, &path).expect("Failed to install fake tool");
    }
}

/// A scheduler wired to a fake tool, a temporary template tree and an
/// in-memory store.
pub struct TestEnvironment {
    pub root: TempDir,
    pub tool: FakeTool,
    pub store: TenantStore,
    pub scheduler: TaskScheduler,
}

impl TestEnvironment {
    pub async fn new(tool: FakeTool) -> Self {
        Self::with_timeouts(tool, ToolSettings::default()).await
    }

    /// `settings.binary` is replaced with the fake tool.
    pub async fn with_timeouts(tool: FakeTool, settings: ToolSettings) -> Self {
        let root = TempDir::new().expect("Failed to create test root");
        let template_dir = root.path().join("template");
        seed_template(&template_dir);

        let credentials = root.path().join("terraform-sa.json");
        std::fs::write(&credentials, "{}").expect("Failed to write credentials");

        let workspaces = WorkspaceManager::new(WorkspaceSettings {
            deployments_root: root.path().join("deployments"),
            template_dir,
            project_id: "test-project".to_string(),
            state_bucket: "test-state-bucket".to_string(),
            credentials_source: Some(credentials),
        });

        let tool_settings = ToolSettings {
            binary: tool.binary(),
            ..settings
        };

        let store = TenantStore::new(create_test_db().await);
        let pipeline = DeploymentPipeline::new(workspaces, tool_settings);
        let scheduler = TaskScheduler::new(store.clone(), pipeline);

        Self {
            root,
            tool,
            store,
            scheduler,
        }
    }

    pub fn workspace(&self, tenant_id: &str) -> PathBuf {
        self.root.path().join("deployments").join(tenant_id)
    }
}

/// Minimal template tree: one real file, one template-only marker and a
/// stale tool data dir, the last two of which must not be copied.
pub fn seed_template(dir: &Path) {
    std::fs::create_dir_all(dir.join(".terraform/providers")).expect("Failed to create template");
    std::fs::create_dir_all(dir.join("modules/db")).expect("Failed to create template");
    std::fs::write(dir.join("main.tf"), "# tenant resources\n").expect("Failed to seed template");
    std::fs::write(dir.join("modules/db/main.tf"), "# db module\n").expect("Failed to seed template");
    std::fs::write(dir.join("terraform.tfvars.template"), "# example vars\n")
        .expect("Failed to seed template");
    std::fs::write(dir.join(".terraform/providers/lock"), "stale").expect("Failed to seed template");
}
