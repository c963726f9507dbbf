use clap::Parser;
use folio_analytics::config::{Ctx, Env, setup_tracing};
use folio_analytics::launch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let parsed_env = Env::parse();
    let ctx = Ctx::load_file(&parsed_env.config_file)?;

    setup_tracing(&ctx.log_level);

    launch(ctx).await
}
