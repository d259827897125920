//! Ballot and voter content, and the election definition supplied at setup.

use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::clock::IdGenerator;
use crate::error::ValidationError;
use crate::state::{BallotState, VoterState};
use crate::transaction::{Content, SignatureOptions};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voter {
    pub name: String,
    pub id: String,
}

impl Voter {
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Voter {
            name: name.into(),
            id: id.into(),
        }
    }
}

impl Content for Voter {
    type State = VoterState;
    const KIND: &'static str = "voter";

    fn entity_id(&self) -> &str {
        &self.id
    }

    fn signature_contents(&self, _options: SignatureOptions) -> String {
        self.id.clone()
    }
}

/// Identifies one countable choice across all ballots of an election.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChoiceKey {
    pub item: String,
    pub choice: String,
}

impl ChoiceKey {
    pub fn new(item: impl Into<String>, choice: impl Into<String>) -> Self {
        ChoiceKey {
            item: item.into(),
            choice: choice.into(),
        }
    }
}

impl fmt::Display for ChoiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.item, self.choice)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub description: String,
    #[serde(default)]
    pub chosen: bool,
}

impl Choice {
    pub fn new(description: impl Into<String>) -> Self {
        Choice {
            description: description.into(),
            chosen: false,
        }
    }

    fn signature_contents(&self, options: SignatureOptions) -> String {
        if options.include_chosen {
            format!("{}:{}", self.description, self.chosen)
        } else {
            self.description.clone()
        }
    }
}

/// A position on the ballot, allowing up to `max_choices` selections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotItem {
    pub title: String,
    pub description: String,
    pub max_choices: usize,
    pub choices: Vec<Choice>,
}

impl BallotItem {
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        max_choices: usize,
        choices: Vec<Choice>,
    ) -> Self {
        BallotItem {
            title: title.into(),
            description: description.into(),
            max_choices,
            choices,
        }
    }

    pub fn selected_count(&self) -> usize {
        self.choices.iter().filter(|choice| choice.chosen).count()
    }

    pub fn is_full(&self) -> bool {
        self.selected_count() >= self.max_choices
    }

    pub fn select(&mut self, description: &str) -> Result<(), ValidationError> {
        let full = self.is_full();
        let choice = self
            .choices
            .iter_mut()
            .find(|choice| choice.description == description)
            .ok_or_else(|| ValidationError::UnknownChoice {
                item: self.title.clone(),
                choice: description.to_string(),
            })?;
        if choice.chosen {
            return Ok(());
        }
        if full {
            return Err(ValidationError::ItemFull(self.title.clone()));
        }
        choice.chosen = true;
        Ok(())
    }

    pub fn clear(&mut self) {
        for choice in &mut self.choices {
            choice.chosen = false;
        }
    }

    fn signature_contents(&self, options: SignatureOptions) -> String {
        let mut parts = vec![
            self.title.clone(),
            self.description.clone(),
            self.max_choices.to_string(),
        ];
        parts.extend(self.choices.iter().map(|choice| choice.signature_contents(options)));
        parts.join(":")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    id: String,
    election: String,
    items: Vec<BallotItem>,
}

impl Ballot {
    /// Creates a blank ballot; any selections present in `items` are cleared.
    pub fn new(
        id: impl Into<String>,
        election: impl Into<String>,
        mut items: Vec<BallotItem>,
    ) -> Self {
        items.iter_mut().for_each(BallotItem::clear);
        Ballot {
            id: id.into(),
            election: election.into(),
            items,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn election(&self) -> &str {
        &self.election
    }

    pub fn items(&self) -> &[BallotItem] {
        &self.items
    }

    /// Marks `choice` on the item titled `key.item`.
    pub fn select(&mut self, key: &ChoiceKey) -> Result<(), ValidationError> {
        let item = self
            .items
            .iter_mut()
            .find(|item| item.title == key.item)
            .ok_or_else(|| ValidationError::UnknownChoice {
                item: key.item.clone(),
                choice: key.choice.clone(),
            })?;
        item.select(&key.choice)
    }

    /// Every item carries at least one selection.
    pub fn is_filled(&self) -> bool {
        self.items.iter().all(|item| item.selected_count() > 0)
    }

    pub fn selected_choices(&self) -> Vec<ChoiceKey> {
        self.items
            .iter()
            .flat_map(|item| {
                item.choices
                    .iter()
                    .filter(|choice| choice.chosen)
                    .map(move |choice| {
                        ChoiceKey::new(item.title.clone(), choice.description.clone())
                    })
            })
            .collect()
    }

    pub fn choice_keys(&self) -> impl Iterator<Item = ChoiceKey> + '_ {
        choice_keys(&self.items)
    }
}

impl Content for Ballot {
    type State = BallotState;
    const KIND: &'static str = "ballot";
    const TWO_PHASE: bool = true;

    fn entity_id(&self) -> &str {
        &self.id
    }

    fn signature_contents(&self, options: SignatureOptions) -> String {
        let mut parts = vec![self.id.clone(), self.election.clone()];
        parts.extend(self.items.iter().map(|item| item.signature_contents(options)));
        parts.join(":")
    }

    fn selected_choices(&self) -> Vec<ChoiceKey> {
        Ballot::selected_choices(self)
    }
}

fn choice_keys(items: &[BallotItem]) -> impl Iterator<Item = ChoiceKey> + '_ {
    items.iter().flat_map(|item| {
        item.choices
            .iter()
            .map(move |choice| ChoiceKey::new(item.title.clone(), choice.description.clone()))
    })
}

/// Ballot content and voter roll, fixed before any node starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionDefinition {
    pub name: String,
    pub items: Vec<BallotItem>,
    pub voter_roll: Vec<Voter>,
}

impl ElectionDefinition {
    pub fn from_json(json: &str) -> Result<Self, crate::Error> {
        let definition: ElectionDefinition = serde_json::from_str(json)?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn load(path: &Path) -> Result<Self, crate::Error> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Self::from_json(&contents)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.items.is_empty() {
            return Err(ValidationError::InvalidDefinition("ballot has no items".to_string()));
        }
        let mut titles = BTreeSet::new();
        for item in &self.items {
            if !titles.insert(item.title.as_str()) {
                return Err(ValidationError::InvalidDefinition(format!(
                    "duplicate item `{}`",
                    item.title
                )));
            }
            if item.choices.is_empty() || item.max_choices == 0 {
                return Err(ValidationError::InvalidDefinition(format!(
                    "item `{}` admits no selection",
                    item.title
                )));
            }
            let mut descriptions = BTreeSet::new();
            if !item.choices.iter().all(|choice| descriptions.insert(choice.description.as_str())) {
                return Err(ValidationError::InvalidDefinition(format!(
                    "item `{}` repeats a choice",
                    item.title
                )));
            }
        }
        let mut ids = BTreeSet::new();
        if let Some(voter) = self.voter_roll.iter().find(|voter| !ids.insert(voter.id.as_str())) {
            return Err(ValidationError::InvalidDefinition(format!(
                "duplicate voter id `{}`",
                voter.id
            )));
        }
        Ok(())
    }

    pub fn voter(&self, id: &str) -> Option<&Voter> {
        self.voter_roll.iter().find(|voter| voter.id == id)
    }

    pub fn choice_keys(&self) -> impl Iterator<Item = ChoiceKey> + '_ {
        choice_keys(&self.items)
    }

    /// A blank ballot used to check selections before a real one is handed out.
    pub fn specimen(&self) -> Ballot {
        Ballot::new("specimen", self.name.clone(), self.items.clone())
    }
}

/// Generates `count` blank ballots with unique identifiers.
pub fn generate_ballots(
    election: &str,
    items: &[BallotItem],
    count: usize,
    ids: &mut dyn IdGenerator,
) -> Result<Vec<Ballot>, ValidationError> {
    let mut seen = BTreeSet::new();
    let mut ballots = Vec::with_capacity(count);
    for _ in 0..count {
        let id = ids.next_id();
        if !seen.insert(id.clone()) {
            return Err(ValidationError::DuplicateBallotId(id));
        }
        ballots.push(Ballot::new(id, election, items.to_vec()));
    }
    Ok(ballots)
}
