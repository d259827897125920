//! HTTP surface over a running precinct.

use std::path::PathBuf;

use actix_web::{web, HttpResponse, Responder};
use log::{error, info};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;

use crate::election::ChoiceKey;
use crate::error::{Error, ValidationError};
use crate::precinct::Precinct;
use crate::store::save_blocks;

pub struct AppState {
    pub precinct: Mutex<Precinct>,
    /// Where both chains are written after every round.
    pub chain_dir: Option<PathBuf>,
}

impl AppState {
    pub fn new(precinct: Precinct, chain_dir: Option<PathBuf>) -> Self {
        AppState {
            precinct: Mutex::new(precinct),
            chain_dir,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct VoteRequest {
    pub voter_id: String,
    pub selections: Vec<ChoiceKey>,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/vote", web::post().to(cast_vote))
        .route("/round", web::post().to(close_round))
        .route("/results", web::get().to(results))
        .route("/ballots/{id}", web::get().to(ballot_state))
        .route("/voters/{id}", web::get().to(voter_state))
        .route("/chain/votes", web::get().to(vote_chain))
        .route("/chain/voters", web::get().to(voter_chain))
        .route("/audit", web::get().to(audit));
}

async fn cast_vote(data: web::Data<AppState>, vote: web::Json<VoteRequest>) -> impl Responder {
    let vote = vote.into_inner();
    let mut precinct = data.precinct.lock().await;
    match precinct.cast_vote(&vote.voter_id, &vote.selections) {
        Ok(receipt) => HttpResponse::Ok().json(receipt),
        Err(err) => error_response(&err),
    }
}

async fn close_round(data: web::Data<AppState>) -> impl Responder {
    let mut precinct = data.precinct.lock().await;
    let report = match precinct.close_round() {
        Ok(report) => report,
        Err(err) => return error_response(&err),
    };

    if let Some(dir) = &data.chain_dir {
        let saved = save_blocks(&dir.join("vote_chain.json"), &precinct.vote_chain())
            .and_then(|()| save_blocks(&dir.join("voter_chain.json"), &precinct.voter_chain()));
        if let Err(err) = saved {
            error!("failed to persist chains to {}: {}", dir.display(), err);
            return HttpResponse::InternalServerError()
                .body(format!("Failed to save blocks: {}", err));
        }
        info!("chains written to {}", dir.display());
    }
    HttpResponse::Ok().json(report)
}

async fn results(data: web::Data<AppState>) -> impl Responder {
    let precinct = data.precinct.lock().await;
    HttpResponse::Ok().json(precinct.results())
}

async fn ballot_state(data: web::Data<AppState>, id: web::Path<String>) -> impl Responder {
    let precinct = data.precinct.lock().await;
    match precinct.ballot_state(&id) {
        Some(state) => HttpResponse::Ok().json(json!({ "ballot": id.as_str(), "state": state })),
        None => HttpResponse::NotFound().body(format!("Unknown ballot {}", id)),
    }
}

async fn voter_state(data: web::Data<AppState>, id: web::Path<String>) -> impl Responder {
    let precinct = data.precinct.lock().await;
    match precinct.voter_state(&id) {
        Some(state) => HttpResponse::Ok().json(json!({ "voter": id.as_str(), "state": state })),
        None => HttpResponse::NotFound().body(format!("Unknown voter {}", id)),
    }
}

async fn vote_chain(data: web::Data<AppState>) -> impl Responder {
    let precinct = data.precinct.lock().await;
    HttpResponse::Ok().json(precinct.vote_chain())
}

async fn voter_chain(data: web::Data<AppState>) -> impl Responder {
    let precinct = data.precinct.lock().await;
    HttpResponse::Ok().json(precinct.voter_chain())
}

async fn audit(data: web::Data<AppState>) -> impl Responder {
    let precinct = data.precinct.lock().await;
    HttpResponse::Ok().json(precinct.audit())
}

fn error_response(err: &Error) -> HttpResponse {
    let mut response = match err {
        Error::Validation(ValidationError::NotRegistered(_)) => HttpResponse::NotFound(),
        Error::Validation(
            ValidationError::AlreadyVoted(_) | ValidationError::NoBallotsAvailable,
        ) => HttpResponse::Conflict(),
        Error::Validation(_) => HttpResponse::BadRequest(),
        _ => {
            error!("request failed: {}", err);
            HttpResponse::InternalServerError()
        }
    };
    response.body(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SequentialIds};
    use crate::election::tests::definition;
    use crate::models::LedgerSummary;
    use crate::precinct::PrecinctConfig;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn state() -> web::Data<AppState> {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2018, 11, 6, 8, 0, 0).unwrap()));
        let config = PrecinctConfig {
            voting_computers: 2,
            voter_computers: 2,
            key_bits: 1024,
            seed: Some(3),
            ..PrecinctConfig::default()
        };
        let precinct =
            Precinct::setup(definition(), config, clock, &mut SequentialIds::new("b")).unwrap();
        web::Data::new(AppState::new(precinct, None))
    }

    fn vote(voter_id: &str) -> serde_json::Value {
        json!({
            "voter_id": voter_id,
            "selections": [
                { "item": "President", "choice": "Y" },
                { "item": "Vice President", "choice": "V1" },
            ],
        })
    }

    #[actix_web::test]
    async fn test_vote_round_and_results() {
        let app = test::init_service(App::new().app_data(state()).configure(configure)).await;

        let req = test::TestRequest::post().uri("/vote").set_json(vote("1")).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let req = test::TestRequest::post().uri("/vote").set_json(vote("1")).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let req = test::TestRequest::post().uri("/round").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let req = test::TestRequest::get().uri("/results").to_request();
        let summary: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(summary["counts"]["ballot_used"], 1);
        assert!(summary["tallies"]
            .as_array()
            .unwrap()
            .iter()
            .any(|entry| entry["choice"] == "Y" && entry["votes"] == 1));

        let req = test::TestRequest::get().uri("/voters/1").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["state"], "voted");

        let req = test::TestRequest::get().uri("/chain/votes").to_request();
        let chain: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(chain.as_array().unwrap().len(), 1);
    }

    #[actix_web::test]
    async fn test_unknown_voter_and_ballot() {
        let app = test::init_service(App::new().app_data(state()).configure(configure)).await;

        let req = test::TestRequest::post().uri("/vote").set_json(vote("404")).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::get().uri("/ballots/nope").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_audit_starts_clean() {
        let data = state();
        let app = test::init_service(App::new().app_data(data.clone()).configure(configure)).await;
        let req = test::TestRequest::get().uri("/audit").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["consistent"], true);
        assert_eq!(body["vote_chain_height"], 0);

        let summary: LedgerSummary = data.precinct.lock().await.turnout();
        assert_eq!(summary.counts["not voted"], 2);
    }
}
