use cellstream::config::resolve_api_key;
use cellstream::document::Notebook;
use cellstream::engine::{CompletionEngine, SessionContext};
use cellstream::logging::{init_tracing, setup_panic_hook};
use cellstream::main_helper::Args;
use cellstream::operator::TerminalOperator;
use cellstream::provider::OpenAiBackend;
use cellstream::tools::ToolRegistry;
use cellstream::types::*;
use clap::Parser;
use colored::Colorize;
use tokio_util::sync::CancellationToken;

async fn run(args: Args) -> Result<FinishReason> {
    let notebook = Notebook::open(&args.notebook).await?;
    let mut ctx = SessionContext::capture(&notebook, args.cell).await?;
    args.apply_overrides(&mut ctx.settings)?;

    let api_key = resolve_api_key(args.api_key.as_deref())?;
    let backend = OpenAiBackend::new(api_key, &args.client_options())?;
    let operator = TerminalOperator::new(args.yes);
    let tools = ToolRegistry::new(args.workspace_root());

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("[MAIN] Interrupt received, cancelling");
            on_interrupt.cancel();
        }
    });

    let engine = CompletionEngine::new(&backend, &operator, &tools, args.engine_options());
    let outcome = engine.run(&ctx, cancel).await;

    // Whatever was streamed so far stays in the notebook, even on failure.
    notebook.save().await?;
    outcome
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let _guard = match init_tracing(&args.logging_config()) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("{} {}", "Failed to initialize logging:".red(), e.inner);
            std::process::exit(1);
        }
    };
    setup_panic_hook();

    tracing::info!(
        "[MAIN] Completing cell {} of {}",
        args.cell,
        args.notebook.display()
    );

    match run(args).await {
        Ok(reason) => {
            tracing::info!("[MAIN] Done ({})", reason);
        }
        Err(e) => {
            tracing::error!("[MAIN] {}", e);
            eprintln!("{} {}", "error:".red().bold(), e.detail());
            std::process::exit(1);
        }
    }
}
