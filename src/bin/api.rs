use clap::Parser;
use house_price_pipeline::api;
use house_price_pipeline::config::{init_logging, ApiArgs};
use house_price_pipeline::storage::open_store;

fn main() -> anyhow::Result<()> {
    init_logging();
    let args = ApiArgs::parse();
    let addr = args.bind_addr()?;

    // Load the model before anything listens; no model, no server
    let model = {
        let store = open_store(&args.data_lake)?;
        api::load_model(store.as_ref(), &args.data_lake.model_key())?
    };

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(api::serve(addr, model))
}
