use anyhow::{Context, Result};
use sqlflow::cli::commands::{RenderCommand, RunCommand, ValidateCommand};
use sqlflow::cli::output::*;
use sqlflow::cli::{Cli, Command};
use sqlflow::core::config::RunConfig;
use sqlflow::engine::{build_engine, run_startup_probe};
use sqlflow::execution::{run_pipeline, serve_metrics, MetricsRegistry, SqlTemplates, TemplateRenderer};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Environment variable overriding the log filter
const LOG_ENV: &str = "SQLFLOW_LOG";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    // Execute command
    match &cli.command {
        Command::Run(cmd) => run(cmd).await?,
        Command::Render(cmd) => render(cmd)?,
        Command::Validate(cmd) => validate(cmd)?,
    }

    Ok(())
}

async fn run(cmd: &RunCommand) -> Result<()> {
    let vars = cmd.vars();
    let config = RunConfig::from_file(&cmd.file, &vars).context("Failed to load run file")?;
    let templates = SqlTemplates::load_dir(&cmd.template_path)
        .with_context(|| format!("Failed to load templates from {}", cmd.template_path))?;
    info!(templates = templates.len(), "templates loaded");

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let metrics = MetricsRegistry::new().context("Failed to create metrics registry")?;
    let metrics_server = match &config.prom_addr {
        Some(addr) => {
            let addr: SocketAddr = addr
                .parse()
                .with_context(|| format!("Invalid prom_addr: {}", addr))?;
            let metrics = metrics.clone();
            let cancel = cancel.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = serve_metrics(addr, metrics, cancel).await {
                    error!(error = %e, "metrics server failed");
                }
            }))
        }
        None => None,
    };

    let engine = build_engine(&config.engine, &vars)
        .await
        .context("Failed to create engine")?;
    engine.start().await.context("Failed to start engine")?;
    println!("{} Engine started", ROCKET);

    let mut engine_exit = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.wait().await })
    };

    let pipeline = async {
        run_startup_probe(engine.as_ref(), &config.startup_probe, &cancel).await?;
        run_pipeline(
            engine.clone(),
            Arc::new(templates),
            vars.clone(),
            &config.pipeline,
            metrics.clone(),
            cancel.clone(),
        )
        .await?;
        anyhow::Ok(())
    };

    let (result, engine_done) = tokio::select! {
        result = pipeline => (result, None),
        exit = &mut engine_exit => {
            let exit = exit.context("Engine task failed")?;
            warn!("engine exited before the pipeline finished");
            (Err(anyhow::anyhow!("engine exited before the pipeline finished")), Some(exit))
        }
    };

    engine.stop().await;
    let engine_result = match engine_done {
        Some(exit) => exit,
        None => engine_exit.await.context("Engine task failed")?,
    };

    cancel.cancel();
    if let Some(server) = metrics_server {
        let _ = server.await;
    }

    if let Err(e) = engine_result {
        error!(error = %e, "engine shutdown failed");
        if result.is_ok() {
            return Err(e).context("Engine shutdown failed");
        }
    }

    match result {
        Ok(()) => {
            println!(
                "{} Pipeline completed {} ({} records finalized)",
                CHECK,
                style("successfully").green(),
                style(metrics.finalized()).cyan()
            );
            Ok(())
        }
        Err(e) => {
            println!("{} Pipeline {}", CROSS, style("failed").red());
            Err(e)
        }
    }
}

/// Cancel the run on Ctrl-C or SIGTERM
async fn shutdown_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("interrupt received, shutting down");
    cancel.cancel();
}

fn render(cmd: &RenderCommand) -> Result<()> {
    let templates = SqlTemplates::load_dir(&cmd.template_path)
        .with_context(|| format!("Failed to load templates from {}", cmd.template_path))?;
    let vars = cmd.vars();

    let mut failed = 0;
    for name in templates.names() {
        if cmd.filter.as_ref().is_some_and(|glob| !glob.is_match(&name)) {
            continue;
        }

        println!("{}", format_template_header(&name));
        match templates.render(&name, &vars) {
            Ok(sql) => println!("{}\n", sql.trim_end()),
            Err(e) => {
                failed += 1;
                println!("{} {}\n", CROSS, style(e).red());
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} templates failed to render", failed);
    }
    Ok(())
}

fn validate(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating {}...", INFO, cmd.file);

    match RunConfig::from_file(&cmd.file, &cmd.vars()) {
        Ok(config) => {
            println!("{} Run file is valid!", CHECK);
            println!("{}", format_pipeline_summary(&config.pipeline, &config.engine));
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            std::process::exit(1);
        }
    }
}
