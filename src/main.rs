use std::error::Error;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use log::info;

use ballot_ledger::api::{self, AppState};
use ballot_ledger::clock::{RandomIds, SystemClock};
use ballot_ledger::config::Config;
use ballot_ledger::crypto::Keypair;
use ballot_ledger::election::ElectionDefinition;
use ballot_ledger::precinct::{Precinct, PrecinctConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env()?;
    let definition = ElectionDefinition::load(&config.election_path)?;
    info!(
        "loaded {} with {} items and {} registered voters",
        definition.name,
        definition.items.len(),
        definition.voter_roll.len()
    );

    let issuer_key = match &config.key_dir {
        Some(dir) => Some(Keypair::load_or_generate(&dir.join("issuer_key.pem"), config.key_bits)?),
        None => None,
    };
    let mut ids = match config.seed {
        Some(seed) => RandomIds::seeded(seed),
        None => RandomIds::new(),
    };
    let precinct = Precinct::setup(
        definition,
        PrecinctConfig {
            voting_computers: config.voting_computers,
            voter_computers: config.voter_computers,
            key_bits: config.key_bits,
            seed: config.seed,
            issuer_key,
            ..PrecinctConfig::default()
        },
        Arc::new(SystemClock),
        &mut ids,
    )?;

    let state = web::Data::new(AppState::new(precinct, config.chain_dir.clone()));
    info!("listening on {}", config.bind_addr);
    HttpServer::new(move || App::new().app_data(state.clone()).configure(api::configure))
        .bind(&config.bind_addr)?
        .run()
        .await?;
    Ok(())
}
