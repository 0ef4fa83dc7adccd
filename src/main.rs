use anyhow::Context;
use std::path::Path;
use testrig::cli::{Args, ExecutionMode, HarnessKind, RunConfig, TerraformConfig};
use testrig::compose::HarnessSpec;
use testrig::harness::{Env, ExecConfig, Harness, HarnessRegistry, HostRuntime};
use testrig::runner::Terraform;
use testrig::{ConfigDiscovery, ProviderConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("testrig=info")),
        )
        .init();

    let args = Args::parse();
    let mode = match args.mode() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    let ctx = CancellationToken::new();
    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            interrupt.cancel();
        }
    });

    match mode {
        ExecutionMode::Run(config) => {
            let code = run_harness(config, &ctx).await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        ExecutionMode::Terraform(config) => run_terraform(config, &ctx).await,
        ExecutionMode::ShowConfig => {
            println!("{}", ConfigDiscovery::discovery_report());
            let (_, config) = ConfigDiscovery::discover_config()?;
            println!("\n{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn load_config(config_override: Option<&Path>) -> anyhow::Result<ProviderConfig> {
    match config_override {
        Some(path) => {
            info!("Loading configuration override from: {:?}", path);
            Ok(ProviderConfig::from_toml_file(path)?)
        }
        None => Ok(ConfigDiscovery::discover_config()?.1),
    }
}

async fn run_harness(config: RunConfig, ctx: &CancellationToken) -> anyhow::Result<i32> {
    let provider = load_config(config.config_override.as_deref())?;
    let source = std::fs::read_to_string(&config.spec)
        .with_context(|| format!("reading harness spec {}", config.spec.display()))?;
    let spec = HarnessSpec::from_toml(&source)?;

    let harness = match config.kind {
        HarnessKind::Host => {
            let env = Env::from_pairs(spec.envs.clone())?;
            Harness::new(spec.id.clone(), HostRuntime::new(spec.id.clone()).with_env(env))
        }
        HarnessKind::Docker => docker_harness(&provider, &spec).await?,
    };

    let registry = HarnessRegistry::new();
    registry.setup(harness, ctx).await?;

    let mut exec = ExecConfig::new(config.command);
    if let Some(dir) = config.working_dir {
        exec = exec.with_working_dir(dir);
    }
    let result = registry.exec(&spec.id, ctx, &exec).await;

    // Teardown must outlive an interrupted run.
    let cleanup = CancellationToken::new();
    if let Err(e) = registry.teardown(&spec.id, &cleanup).await {
        warn!("Teardown of harness {} failed: {}", spec.id, e);
    }

    let output = result?;
    print!("{}", output.text());
    Ok(output.exit_code.map_or(1, |code| i32::try_from(code).unwrap_or(1)))
}

#[cfg(feature = "containers")]
async fn docker_harness(provider: &ProviderConfig, spec: &HarnessSpec) -> anyhow::Result<Harness> {
    use testrig::container::{
        ContainerClient, ContainerClientConfig, ContainerOrchestrator, ContainerOrchestratorConfig,
    };
    use testrig::harness::DockerRuntime;

    let mut client_config = ContainerClientConfig::default();
    if let Some(socket) = &provider.harnesses.docker.host_socket_path {
        client_config = client_config.with_socket_path(socket.clone());
    }
    let client = ContainerClient::with_config(client_config).await?;
    let orchestrator = ContainerOrchestrator::with_client(client, ContainerOrchestratorConfig::default());

    let base_dir = std::env::current_dir().context("resolving current directory")?;
    let composer = provider.composer(base_dir);
    let composed = composer.compose(spec, &orchestrator.volumes()).await?;

    Ok(Harness::new(
        spec.id.clone(),
        DockerRuntime::new(composed, orchestrator),
    ))
}

#[cfg(not(feature = "containers"))]
async fn docker_harness(_provider: &ProviderConfig, _spec: &HarnessSpec) -> anyhow::Result<Harness> {
    anyhow::bail!("docker harnesses require the `containers` feature")
}

async fn run_terraform(config: TerraformConfig, ctx: &CancellationToken) -> anyhow::Result<()> {
    let provider = load_config(config.config_override.as_deref())?;
    let mut terraform = Terraform::with_config(&config.dir, provider.runner);

    let outputs = terraform.apply(ctx).await?;
    println!("{}", serde_json::to_string_pretty(&outputs)?);

    if config.destroy {
        terraform.destroy(ctx).await?;
    }
    Ok(())
}
