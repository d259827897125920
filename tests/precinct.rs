use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};

use ballot_ledger::clock::{ManualClock, SequentialIds};
use ballot_ledger::election::{ChoiceKey, ElectionDefinition};
use ballot_ledger::ledger::ConflictKind;
use ballot_ledger::node::{Agent, Envelope, Message};
use ballot_ledger::precinct::{Precinct, PrecinctConfig};
use ballot_ledger::state::{BallotState, VoterState};
use ballot_ledger::store::{load_blocks, save_blocks, verify_links};

const ELECTION: &str = r#"{
    "name": "2018 General Election",
    "items": [
        {
            "title": "President",
            "description": "President of the United States",
            "max_choices": 1,
            "choices": [{ "description": "Lincoln" }, { "description": "Douglas" }]
        },
        {
            "title": "Measure 1",
            "description": "Bond measure",
            "max_choices": 1,
            "choices": [{ "description": "Yes" }, { "description": "No" }]
        }
    ],
    "voter_roll": [
        { "name": "Ada", "id": "100" },
        { "name": "Grace", "id": "101" },
        { "name": "Edsger", "id": "102" },
        { "name": "Barbara", "id": "103" },
        { "name": "Donald", "id": "104" },
        { "name": "Frances", "id": "105" }
    ]
}"#;

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2018, 11, 6, 7, 0, 0).unwrap()))
}

fn precinct(config: PrecinctConfig, clock: Arc<ManualClock>) -> Precinct {
    let definition = ElectionDefinition::from_json(ELECTION).unwrap();
    Precinct::setup(definition, config, clock, &mut SequentialIds::new("ballot-")).unwrap()
}

fn honest() -> PrecinctConfig {
    PrecinctConfig {
        voting_computers: 3,
        voter_computers: 2,
        key_bits: 1024,
        seed: Some(2018),
        ..PrecinctConfig::default()
    }
}

fn picks(president: &str, measure: &str) -> Vec<ChoiceKey> {
    vec![
        ChoiceKey::new("President", president),
        ChoiceKey::new("Measure 1", measure),
    ]
}

#[test]
fn test_honest_election() {
    let clock = clock();
    let mut precinct = precinct(honest(), clock.clone());

    precinct.cast_vote("100", &picks("Lincoln", "Yes")).unwrap();
    precinct.cast_vote("101", &picks("Lincoln", "No")).unwrap();
    clock.advance(Duration::minutes(5));
    precinct.close_round().unwrap();

    precinct.cast_vote("102", &picks("Douglas", "Yes")).unwrap();
    clock.advance(Duration::minutes(5));
    precinct.close_round().unwrap();

    let ledger = precinct.vote_ledger();
    assert_eq!(ledger.tally_of(&ChoiceKey::new("President", "Lincoln")), Some(2));
    assert_eq!(ledger.tally_of(&ChoiceKey::new("President", "Douglas")), Some(1));
    assert_eq!(ledger.tally_of(&ChoiceKey::new("Measure 1", "Yes")), Some(2));
    assert_eq!(ledger.count(BallotState::Used), 3);
    assert_eq!(ledger.count(BallotState::Created), 3);
    assert_eq!(precinct.voter_state("102"), Some(VoterState::Voted));
    assert_eq!(precinct.voter_state("103"), Some(VoterState::NotVoted));

    // Paper trail and ledger agree.
    assert_eq!(precinct.paper_trail().len(), 3);
    for ballot in precinct.paper_trail() {
        assert_eq!(precinct.ballot_state(ballot.id()), Some(BallotState::Used));
    }

    let audit = precinct.audit();
    assert!(audit.consistent);
    assert!(audit.rejected.is_empty());
    assert!(audit.conflicts.is_empty());
    assert_eq!(audit.vote_chain_height, 2);
    assert_eq!(audit.voter_chain_height, 2);
}

#[test]
fn test_counters_always_cover_every_entity() {
    let clock = clock();
    let mut precinct = precinct(honest(), clock.clone());
    for (round, voter) in ["100", "101", "102", "103"].iter().enumerate() {
        precinct.cast_vote(voter, &picks("Douglas", "No")).unwrap();
        clock.advance(Duration::minutes(round as i64 + 1));
        precinct.close_round().unwrap();

        let results = precinct.results();
        assert_eq!(results.counts.values().sum::<u64>(), results.entities);
        let turnout = precinct.turnout();
        assert_eq!(turnout.counts.values().sum::<u64>(), turnout.entities);
        assert_eq!(turnout.counts["voted"], round as u64 + 1);
    }
}

#[test]
fn test_every_replica_shares_the_head() {
    let clock = clock();
    let mut precinct = precinct(honest(), clock.clone());
    precinct.cast_vote("104", &picks("Lincoln", "Yes")).unwrap();
    precinct.close_round().unwrap();

    let network = precinct.ballot_network();
    let heads: Vec<_> = precinct
        .voting_computers()
        .iter()
        .map(|booth| network.node(booth).unwrap().core().chain().head_header().cloned())
        .collect();
    assert!(heads[0].is_some());
    assert!(heads.iter().all(|head| *head == heads[0]));
}

#[test]
fn test_unsigned_stamps_never_reach_the_ledger() {
    let clock = clock();
    let config = PrecinctConfig {
        voting_computers: 1,
        adversary_voting_computers: 1,
        ..honest()
    };
    let mut precinct = precinct(config, clock.clone());
    let rogue = precinct.voting_computers()[1];

    let receipts: Vec<_> = ["100", "101", "102", "103", "104", "105"]
        .iter()
        .map(|voter| precinct.cast_vote(voter, &picks("Lincoln", "No")).unwrap())
        .collect();
    clock.advance(Duration::minutes(10));
    precinct.close_round().unwrap();

    let through_rogue = receipts.iter().filter(|r| r.voting_computer == rogue).count();
    for receipt in &receipts {
        let expected = if receipt.voting_computer == rogue {
            BallotState::Issued
        } else {
            BallotState::Used
        };
        assert_eq!(precinct.ballot_state(&receipt.ballot), Some(expected));
    }

    let audit = precinct.audit();
    assert_eq!(audit.ballots_used as usize, receipts.len() - through_rogue);
    assert_eq!(audit.voters_voted as usize, receipts.len());
    assert_eq!(audit.rejected.len(), through_rogue);
    assert!(audit.rejected.iter().all(|entry| entry.transaction.kind == "ballot"));
    assert_eq!(audit.consistent, through_rogue == 0);
}

#[test]
fn test_forgetful_registrar_double_vote_is_flagged() {
    let clock = clock();
    let config = PrecinctConfig {
        voter_computers: 0,
        adversary_voter_computers: 1,
        ..honest()
    };
    let mut precinct = precinct(config, clock.clone());

    precinct.cast_vote("100", &picks("Lincoln", "Yes")).unwrap();
    precinct.cast_vote("100", &picks("Lincoln", "Yes")).unwrap();
    clock.advance(Duration::minutes(1));
    let report = precinct.close_round().unwrap();

    // The vote itself stands; the second registration is a duplicate.
    assert_eq!(report.voter_block.unwrap().transactions.len(), 1);
    assert_eq!(precinct.voter_state("100"), Some(VoterState::Voted));
    assert_eq!(precinct.vote_ledger().count(BallotState::Used), 2);

    let audit = precinct.audit();
    assert!(!audit.consistent);
    assert_eq!(audit.ballots_used, 2);
    assert_eq!(audit.voters_voted, 1);
    assert_eq!(audit.conflicts.len(), 1);
    assert_eq!(audit.conflicts[0].entity, "100");
    assert_eq!(audit.conflicts[0].conflict, ConflictKind::Duplicate { state: "voted" });
}

#[test]
fn test_competing_block_is_refused() {
    let clock = clock();
    let mut precinct = precinct(honest(), clock.clone());
    precinct.cast_vote("100", &picks("Douglas", "Yes")).unwrap();

    let mut senders = vec![precinct.generator()];
    senders.extend(precinct.voting_computers().iter().copied());
    let first = precinct.voting_computers()[0];
    let second = precinct.voting_computers()[1];
    let network = precinct.ballot_network_mut();
    network.broadcast_from(&senders).unwrap();

    // Both booths build on the empty chain; only one can win.
    let competing = network.node(&second).unwrap().core().propose().unwrap().block;
    let (sealed, _) = network.with_node(&first, |node, outbox| node.seal(outbox)).unwrap();
    let winner = sealed.unwrap().unwrap();

    network.post(vec![Envelope {
        from: second,
        to: first,
        message: Message::Block(competing),
    }]);
    let delivery = network.deliver();
    assert_eq!(delivery.refused, 1);
    let head = network.node(&first).unwrap().core().chain().head_header().cloned();
    assert_eq!(head.as_ref(), Some(winner.header()));
    assert_eq!(network.node(&second).unwrap().core().chain().height(), 1);
}

#[test]
fn test_persisted_chain_links() {
    let clock = clock();
    let mut precinct = precinct(honest(), clock.clone());
    for voter in ["100", "101"] {
        precinct.cast_vote(voter, &picks("Lincoln", "Yes")).unwrap();
        clock.advance(Duration::minutes(1));
        precinct.close_round().unwrap();
    }

    let path = std::env::temp_dir()
        .join(format!("ballot_ledger_chain_{}.json", std::process::id()));
    save_blocks(&path, &precinct.vote_chain()).unwrap();
    let records = load_blocks(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(records.len(), 2);
    verify_links(&records).unwrap();
    assert_eq!(records, precinct.vote_chain());
}
