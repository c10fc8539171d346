use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use tokio::sync::mpsc;

/// Theme and content description for one run, produced by the planner.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GamePlan {
    pub slug: String,
    pub name: String,
    pub description: String,
    /// Opaque build specification handed to the external builder.
    pub build_spec: String,
}

#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub artifact_ref: String,
}

#[derive(Debug, Clone)]
pub struct DeployOutput {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct ChainInit {
    pub pool_address: String,
    /// Token amount the initializer wants routed to the burn sink, if any.
    pub burn_amount: u64,
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self) -> Result<GamePlan>;
}

#[async_trait]
pub trait Builder: Send + Sync {
    /// Run the external build tool. Implementations that spawn an OS process
    /// report the child pid through `pid_tx` as soon as it is known, so a
    /// crash mid-build leaves a sweepable trail.
    async fn build(&self, plan: &GamePlan, pid_tx: mpsc::Sender<u32>) -> Result<BuildOutput>;
}

#[async_trait]
pub trait Deployer: Send + Sync {
    async fn deploy(&self, artifact_ref: &str, slug: &str) -> Result<DeployOutput>;

    /// Reachability probe used by the calibration phase.
    async fn verify(&self, url: &str) -> Result<bool>;
}

#[async_trait]
pub trait PreviewRenderer: Send + Sync {
    /// Render a short preview clip; returns a media reference for the
    /// announcement post.
    async fn render(&self, plan: &GamePlan, url: &str) -> Result<String>;
}

#[async_trait]
pub trait Announcer: Send + Sync {
    /// Publish a post, returning the platform's post id.
    async fn post(&self, text: &str, media: Option<&str>) -> Result<String>;
}

#[async_trait]
pub trait ChainInitializer: Send + Sync {
    async fn initialize(&self, slug: &str, name: &str) -> Result<ChainInit>;
}

// --- Production implementations ---

/// Fallback planner used when no external planner endpoint is configured:
/// picks a theme from a built-in rotation so the daily trigger never stalls
/// on a missing collaborator.
pub struct StaticPlanner;

const THEMES: &[(&str, &str)] = &[
    ("asteroid-drift", "Asteroid Drift"),
    ("neon-burrow", "Neon Burrow"),
    ("tide-runner", "Tide Runner"),
    ("glacier-heist", "Glacier Heist"),
    ("mycelium-maze", "Mycelium Maze"),
];

#[async_trait]
impl Planner for StaticPlanner {
    async fn plan(&self) -> Result<GamePlan> {
        let (base_slug, name) = THEMES[rand::thread_rng().gen_range(0..THEMES.len())];
        let suffix: u32 = rand::thread_rng().gen_range(100..1000);
        let slug = format!("{}-{}", base_slug, suffix);
        Ok(GamePlan {
            slug: slug.clone(),
            name: name.to_string(),
            description: format!("A bite-sized browser game: {}.", name),
            build_spec: serde_json::json!({ "slug": slug, "theme": name }).to_string(),
        })
    }
}

pub struct HttpPlanner {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpPlanner {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl Planner for HttpPlanner {
    async fn plan(&self) -> Result<GamePlan> {
        let plan: GamePlan = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({}))
            .send()
            .await
            .context("planner request")?
            .error_for_status()?
            .json()
            .await
            .context("planner response")?;
        if plan.slug.trim().is_empty() {
            bail!("planner returned an empty slug");
        }
        Ok(plan)
    }
}

/// Spawns the external build tool as a child process, feeding the build spec
/// through an environment variable and collecting stderr on failure.
pub struct ProcessBuilder {
    command: String,
}

impl ProcessBuilder {
    pub fn new(command: String) -> Self {
        Self { command }
    }
}

#[async_trait]
impl Builder for ProcessBuilder {
    async fn build(&self, plan: &GamePlan, pid_tx: mpsc::Sender<u32>) -> Result<BuildOutput> {
        let mut parts = self.command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| anyhow!("empty build command"))?;
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(parts)
            .env("FORGE_SLUG", &plan.slug)
            .env("FORGE_SPEC", &plan.build_spec)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().context("spawning build tool")?;
        if let Some(pid) = child.id() {
            let _ = pid_tx.send(pid).await;
        }

        let output = child
            .wait_with_output()
            .await
            .context("waiting for build tool")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .lines()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join(" | ");
            bail!("build tool exited with {}: {}", output.status, tail);
        }
        Ok(BuildOutput {
            artifact_ref: format!("builds/{}", plan.slug),
        })
    }
}

/// Placeholder used when no deploy endpoint is configured. Deploy is a
/// required phase, so every run fails there with an explicit reason instead
/// of pretending to ship.
pub struct UnconfiguredDeployer;

#[async_trait]
impl Deployer for UnconfiguredDeployer {
    async fn deploy(&self, _artifact_ref: &str, _slug: &str) -> Result<DeployOutput> {
        Err(anyhow!("no deploy endpoint configured"))
    }

    async fn verify(&self, _url: &str) -> Result<bool> {
        Err(anyhow!("no deploy endpoint configured"))
    }
}

pub struct HttpDeployer {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct DeployResponse {
    url: String,
}

impl HttpDeployer {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl Deployer for HttpDeployer {
    async fn deploy(&self, artifact_ref: &str, slug: &str) -> Result<DeployOutput> {
        let response: DeployResponse = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "artifact": artifact_ref, "slug": slug }))
            .send()
            .await
            .context("deploy request")?
            .error_for_status()?
            .json()
            .await
            .context("deploy response")?;
        Ok(DeployOutput { url: response.url })
    }

    async fn verify(&self, url: &str) -> Result<bool> {
        let parsed = url::Url::parse(url).context("deploy URL is not valid")?;
        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .context("verify request")?;
        Ok(response.status().is_success())
    }
}

pub struct HttpRenderer {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct RenderResponse {
    media_ref: String,
}

impl HttpRenderer {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl PreviewRenderer for HttpRenderer {
    async fn render(&self, plan: &GamePlan, url: &str) -> Result<String> {
        let response: RenderResponse = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({
                "slug": plan.slug,
                "name": plan.name,
                "url": url,
            }))
            .send()
            .await
            .context("render request")?
            .error_for_status()?
            .json()
            .await
            .context("render response")?;
        Ok(response.media_ref)
    }
}

pub struct HttpAnnouncer {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct PostResponse {
    id: String,
}

impl HttpAnnouncer {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl Announcer for HttpAnnouncer {
    async fn post(&self, text: &str, media: Option<&str>) -> Result<String> {
        let response: PostResponse = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "text": text, "media": media }))
            .send()
            .await
            .context("announce request")?
            .error_for_status()?
            .json()
            .await
            .context("announce response")?;
        Ok(response.id)
    }
}

pub struct HttpChainInitializer {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct ChainInitResponse {
    pool_address: String,
    #[serde(default)]
    burn_amount: u64,
}

impl HttpChainInitializer {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl ChainInitializer for HttpChainInitializer {
    async fn initialize(&self, slug: &str, name: &str) -> Result<ChainInit> {
        let response: ChainInitResponse = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "slug": slug, "name": name }))
            .send()
            .await
            .context("chain init request")?
            .error_for_status()?
            .json()
            .await
            .context("chain init response")?;
        Ok(ChainInit {
            pool_address: response.pool_address,
            burn_amount: response.burn_amount,
        })
    }
}
