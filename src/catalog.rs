use std::{collections::HashMap, path::Path, str::FromStr};

use serde::Deserialize;
use tracing::info;

use crate::{
    epc::Epc,
    error::{Error, Result},
};

pub const QUESTION_COUNT: usize = 6;

/// Answers per question, F01..F06.
pub const ANSWER_COUNTS: [usize; QUESTION_COUNT] = [6, 5, 5, 6, 6, 5];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Question {
    F01,
    F02,
    F03,
    F04,
    F05,
    F06,
}

impl Question {
    pub const ALL: [Question; QUESTION_COUNT] = [
        Question::F01,
        Question::F02,
        Question::F03,
        Question::F04,
        Question::F05,
        Question::F06,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn answer_count(self) -> usize {
        ANSWER_COUNTS[self.index()]
    }
}

impl std::fmt::Display for Question {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "F{:02}", self.index() + 1)
    }
}

impl FromStr for Question {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "F01" => Ok(Question::F01),
            "F02" => Ok(Question::F02),
            "F03" => Ok(Question::F03),
            "F04" => Ok(Question::F04),
            "F05" => Ok(Question::F05),
            "F06" => Ok(Question::F06),
            other => Err(format!("unknown question '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Answer {
    pub question: Question,
    pub index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Tools,
    Places,
    Programs,
}

/// Six answer indices in F01..F06 order, one per question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnswerSet([usize; QUESTION_COUNT]);

impl AnswerSet {
    pub fn from_indices(indices: [usize; QUESTION_COUNT]) -> Self {
        Self(indices)
    }

    pub fn indices(&self) -> [usize; QUESTION_COUNT] {
        self.0
    }

    pub fn index_of(&self, question: Question) -> usize {
        self.0[question.index()]
    }
}

#[derive(Debug, Deserialize)]
struct CatalogRow {
    epc: Epc,
    question: String,
    answer: usize,
    title: String,
    #[serde(default)]
    tools: String,
    #[serde(default)]
    places: String,
    #[serde(default)]
    programs: String,
}

struct Entry {
    title: String,
    tools: String,
    places: String,
    programs: String,
}

/// Read-only answer catalog, loaded once at startup. Maps each registered
/// token to its `(question, answer)` pair and carries the per-answer titles
/// and resource strings printed on the slip.
pub struct Catalog {
    by_epc: HashMap<Epc, Answer>,
    entries: HashMap<(Question, usize), Entry>,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self> {
        let reader = csv::Reader::from_path(path)
            .map_err(|err| Error::config(format!("cannot read catalog {}: {err}", path.display())))?;
        let catalog = Self::from_csv(reader)?;
        info!(
            "Catalog loaded: {} tokens over {} answers",
            catalog.by_epc.len(),
            catalog.entries.len()
        );
        Ok(catalog)
    }

    pub(crate) fn from_csv_str(data: &str) -> Result<Self> {
        Self::from_csv(csv::Reader::from_reader(data.as_bytes()))
    }

    fn from_csv<R: std::io::Read>(mut reader: csv::Reader<R>) -> Result<Self> {
        let mut by_epc = HashMap::new();
        let mut entries = HashMap::new();

        for row in reader.deserialize() {
            let row: CatalogRow = row?;
            let question: Question = row
                .question
                .parse()
                .map_err(|err: String| Error::config(format!("catalog: {err}")))?;

            if row.answer >= question.answer_count() {
                return Err(Error::config(format!(
                    "catalog: answer {} out of range for {question}",
                    row.answer
                )));
            }

            let answer = Answer {
                question,
                index: row.answer,
            };
            if by_epc.insert(row.epc.clone(), answer).is_some() {
                return Err(Error::config(format!(
                    "catalog: token {} is registered twice",
                    row.epc
                )));
            }

            entries.entry((question, row.answer)).or_insert(Entry {
                title: row.title,
                tools: row.tools,
                places: row.places,
                programs: row.programs,
            });
        }

        for question in Question::ALL {
            for index in 0..question.answer_count() {
                let title = entries
                    .get(&(question, index))
                    .map(|entry| entry.title.trim())
                    .unwrap_or_default();
                if title.is_empty() {
                    return Err(Error::config(format!(
                        "catalog: {question} answer {index} has no title"
                    )));
                }
            }
        }

        Ok(Self { by_epc, entries })
    }

    pub fn answer_of(&self, epc: &Epc) -> Option<Answer> {
        self.by_epc.get(epc).copied()
    }

    pub fn title(&self, question: Question, index: usize) -> &str {
        self.entries
            .get(&(question, index))
            .map(|entry| entry.title.as_str())
            .unwrap_or_default()
    }

    pub fn resource(&self, question: Question, index: usize, kind: ResourceKind) -> &str {
        self.entries
            .get(&(question, index))
            .map(|entry| match kind {
                ResourceKind::Tools => entry.tools.as_str(),
                ResourceKind::Places => entry.places.as_str(),
                ResourceKind::Programs => entry.programs.as_str(),
            })
            .unwrap_or_default()
    }

    /// Resolves one inventory snapshot to a full answer set. Collection order
    /// is irrelevant: every token names its own question.
    pub fn answers_from_tags<'a>(
        &self,
        epcs: impl IntoIterator<Item = &'a Epc>,
    ) -> Result<AnswerSet> {
        let mut slots: [Option<usize>; QUESTION_COUNT] = [None; QUESTION_COUNT];

        for epc in epcs {
            let answer = self
                .answer_of(epc)
                .ok_or_else(|| Error::UnregisteredTag(epc.clone()))?;
            slots[answer.question.index()] = Some(answer.index);
        }

        let mut indices = [0usize; QUESTION_COUNT];
        for (i, slot) in slots.iter().enumerate() {
            match slot {
                Some(index) => indices[i] = *index,
                None => return Err(Error::IncompleteAnswers(Question::ALL[i])),
            }
        }

        Ok(AnswerSet::from_indices(indices))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_csv() -> String {
        let mut csv = String::from("epc,question,answer,title,tools,places,programs\n");
        for (qi, question) in Question::ALL.iter().enumerate() {
            for answer in 0..question.answer_count() {
                csv.push_str(&format!(
                    "{:02X}{:02X}00000000000000000000,{question},{answer},Two Words,hammer,atelier,\n",
                    qi, answer
                ));
            }
        }
        csv
    }

    fn catalog_from(data: &str) -> Result<Catalog> {
        Catalog::from_csv_str(data)
    }

    fn epc_for(question: usize, answer: usize) -> Epc {
        Epc::from_hex_str(&format!("{question:02X}{answer:02X}00000000000000000000"))
            .expect("valid hex")
    }

    #[test]
    fn loads_and_resolves_answers() {
        let catalog = catalog_from(&sample_csv()).expect("catalog loads");

        let answer = catalog.answer_of(&epc_for(2, 4)).expect("registered");
        assert_eq!(answer.question, Question::F03);
        assert_eq!(answer.index, 4);

        assert_eq!(catalog.title(Question::F03, 4), "Two Words");
        assert_eq!(
            catalog.resource(Question::F03, 4, ResourceKind::Tools),
            "hammer"
        );
    }

    #[test]
    fn missing_resource_is_empty_string() {
        let catalog = catalog_from(&sample_csv()).expect("catalog loads");
        assert_eq!(
            catalog.resource(Question::F01, 0, ResourceKind::Programs),
            ""
        );
    }

    #[test]
    fn unknown_epc_is_unregistered() {
        let catalog = catalog_from(&sample_csv()).expect("catalog loads");
        let stranger = Epc::from_bytes(&[0xFF; 12]);
        assert!(catalog.answer_of(&stranger).is_none());
    }

    #[test]
    fn rejects_out_of_range_answer() {
        let bad = "epc,question,answer,title,tools,places,programs\n\
                   AA00000000000000000000AA,F02,5,Too Far,,,\n";
        assert!(catalog_from(bad).is_err());
    }

    #[test]
    fn rejects_missing_title() {
        let mut csv = sample_csv();
        csv = csv.replacen("Two Words", " ", 1);
        assert!(catalog_from(&csv).is_err());
    }

    #[test]
    fn rejects_duplicate_token() {
        let duplicated = "epc,question,answer,title,tools,places,programs\n\
                          AA00000000000000000000AA,F01,0,First Take,,,\n\
                          AA00000000000000000000AA,F01,1,Second Take,,,\n";
        assert!(catalog_from(duplicated).is_err());
    }

    #[test]
    fn answer_set_covers_all_questions() {
        let catalog = catalog_from(&sample_csv()).expect("catalog loads");
        let tags = [
            epc_for(0, 0),
            epc_for(1, 1),
            epc_for(2, 2),
            epc_for(3, 3),
            epc_for(4, 4),
            epc_for(5, 0),
        ];

        let set = catalog.answers_from_tags(tags.iter()).expect("complete");
        assert_eq!(set.indices(), [0, 1, 2, 3, 4, 0]);
        assert_eq!(set.index_of(Question::F05), 4);
    }

    #[test]
    fn unregistered_tag_aborts_resolution() {
        let catalog = catalog_from(&sample_csv()).expect("catalog loads");
        let mut tags = vec![epc_for(0, 0)];
        tags.push(Epc::from_bytes(&[0xFF; 12]));

        match catalog.answers_from_tags(tags.iter()) {
            Err(Error::UnregisteredTag(epc)) => assert_eq!(epc, Epc::from_bytes(&[0xFF; 12])),
            other => panic!("expected unregistered tag, got {other:?}"),
        }
    }

    #[test]
    fn uncovered_question_is_reported() {
        let catalog = catalog_from(&sample_csv()).expect("catalog loads");
        // two tokens answer F01, none answers F02
        let tags = [
            epc_for(0, 0),
            epc_for(0, 1),
            epc_for(2, 2),
            epc_for(3, 3),
            epc_for(4, 4),
            epc_for(5, 0),
        ];

        match catalog.answers_from_tags(tags.iter()) {
            Err(Error::IncompleteAnswers(question)) => assert_eq!(question, Question::F02),
            other => panic!("expected incomplete answers, got {other:?}"),
        }
    }
}
