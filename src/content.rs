use std::{collections::HashMap, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    catalog::{AnswerSet, Catalog, Question},
    error::{Error, Result},
    ratelimit::RateLimiter,
};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const PROMPT_TEMPLATE: &str = "\
You write short, warm museum souvenirs. A visitor assembled figurine number \
{{ figurine_id }} of 27000 from these traits:
{% for answer in answers %}- {{ answer.question }}: {{ answer.title }}
{% endfor %}
Write two paragraphs, each 40 to 60 words, addressed to the visitor. The \
first describes who their figurine is; the second describes what it dreams \
of. Answer with the two paragraphs separated by a line containing only ---.";

#[derive(Debug, Serialize)]
pub struct ProfileAnswer {
    pub question: String,
    pub title: String,
}

#[derive(Debug, Serialize)]
pub struct Profile {
    pub figurine_id: u32,
    pub answers: Vec<ProfileAnswer>,
}

impl Profile {
    pub fn from_answers(catalog: &Catalog, set: &AnswerSet, figurine_id: u32) -> Self {
        let answers = Question::ALL
            .iter()
            .map(|&question| ProfileAnswer {
                question: question.to_string(),
                title: catalog.title(question, set.index_of(question)).to_string(),
            })
            .collect();
        Self {
            figurine_id,
            answers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paragraphs {
    pub first: String,
    pub second: String,
    pub used_fallback: bool,
}

/// The three axes that select a canned fallback text.
pub fn personality_key(set: &AnswerSet) -> (usize, usize, usize) {
    (
        set.index_of(Question::F01),
        set.index_of(Question::F05),
        set.index_of(Question::F06),
    )
}

#[derive(Debug, Deserialize)]
struct FallbackRow {
    answer_f01: usize,
    answer_f05: usize,
    answer_f06: usize,
    paragraph1: String,
    paragraph2: String,
}

/// Canned paragraphs shipped with the application, keyed by the F01/F05/F06
/// personality axes. Loaded once; guaranteed non-empty.
pub struct FallbackTable {
    rows: HashMap<(usize, usize, usize), (String, String)>,
    default_key: (usize, usize, usize),
}

impl FallbackTable {
    pub fn load(path: &Path) -> Result<Self> {
        let reader = csv::Reader::from_path(path).map_err(|err| {
            Error::config(format!("cannot read fallback table {}: {err}", path.display()))
        })?;
        let table = Self::from_csv(reader)?;
        info!("Fallback table loaded: {} rows", table.rows.len());
        Ok(table)
    }

    fn from_csv<R: std::io::Read>(mut reader: csv::Reader<R>) -> Result<Self> {
        let mut rows = HashMap::new();
        for row in reader.deserialize() {
            let row: FallbackRow = row?;
            if row.paragraph1.trim().is_empty() || row.paragraph2.trim().is_empty() {
                return Err(Error::config(format!(
                    "fallback table: empty paragraph for key ({}, {}, {})",
                    row.answer_f01, row.answer_f05, row.answer_f06
                )));
            }
            rows.insert(
                (row.answer_f01, row.answer_f05, row.answer_f06),
                (row.paragraph1, row.paragraph2),
            );
        }

        let default_key = rows
            .keys()
            .min()
            .copied()
            .ok_or_else(|| Error::config("fallback table is empty"))?;

        Ok(Self { rows, default_key })
    }

    pub fn lookup(&self, key: (usize, usize, usize)) -> (&str, &str) {
        let (first, second) = self.rows.get(&key).unwrap_or_else(|| {
            warn!("No fallback row for key {key:?}, using the default row");
            &self.rows[&self.default_key]
        });
        (first.as_str(), second.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ContentSettings {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    text: String,
}

enum AttemptError {
    Retry(String),
    Fatal(Error),
}

/// Remote paragraph oracle. `generate` never fails: when the quota is spent
/// or the service keeps erroring it falls back to the canned table.
pub struct ContentClient {
    http: reqwest::Client,
    settings: ContentSettings,
    limiter: RateLimiter,
    fallback: FallbackTable,
}

impl ContentClient {
    pub fn new(settings: ContentSettings, limiter: RateLimiter, fallback: FallbackTable) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
            limiter,
            fallback,
        }
    }

    pub async fn generate(&self, profile: &Profile, key: (usize, usize, usize)) -> Paragraphs {
        match self.generate_remote(profile).await {
            Ok((first, second)) => Paragraphs {
                first,
                second,
                used_fallback: false,
            },
            Err(err) => {
                warn!("Using fallback paragraphs: {err}");
                let (first, second) = self.fallback.lookup(key);
                Paragraphs {
                    first: first.to_string(),
                    second: second.to_string(),
                    used_fallback: true,
                }
            }
        }
    }

    async fn generate_remote(&self, profile: &Profile) -> Result<(String, String)> {
        self.limiter.reserve().await?;
        let prompt = render_prompt(profile)?;

        let mut delay = BACKOFF_BASE;
        let mut last_reason = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(with_jitter(delay)).await;
                delay *= 2;
            }

            match self.attempt(&prompt).await {
                Ok(text) => {
                    return split_paragraphs(&text)
                        .ok_or_else(|| Error::Request("answer is missing the --- delimiter".into()));
                }
                Err(AttemptError::Retry(reason)) => {
                    warn!("Content attempt {attempt}/{MAX_ATTEMPTS} failed: {reason}");
                    last_reason = reason;
                }
                Err(AttemptError::Fatal(err)) => return Err(err),
            }
        }

        Err(Error::Request(format!(
            "{MAX_ATTEMPTS} attempts failed, last: {last_reason}"
        )))
    }

    async fn attempt(&self, prompt: &str) -> std::result::Result<String, AttemptError> {
        let body = serde_json::json!({
            "model": self.settings.model,
            "prompt": prompt,
            "temperature": 0.8,
            "max_output_tokens": 1024,
        });

        let response = self
            .http
            .post(&self.settings.api_url)
            .bearer_auth(&self.settings.api_key)
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|err| AttemptError::Retry(err.to_string()))?;

        let status = response.status().as_u16();
        if let Some(err) = classify_status(status) {
            return Err(err);
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|err| AttemptError::Retry(format!("bad answer body: {err}")))?;

        if parsed.text.trim().is_empty() {
            return Err(AttemptError::Retry("empty answer body".into()));
        }
        debug!("Content service answered {} chars", parsed.text.len());
        Ok(parsed.text)
    }
}

fn classify_status(status: u16) -> Option<AttemptError> {
    match status {
        200..=299 => None,
        429 => Some(AttemptError::Retry("throttled (HTTP 429)".into())),
        500..=599 => Some(AttemptError::Retry(format!("HTTP {status}"))),
        401 | 403 => Some(AttemptError::Fatal(Error::Auth(status))),
        _ => Some(AttemptError::Fatal(Error::Request(format!("HTTP {status}")))),
    }
}

fn render_prompt(profile: &Profile) -> Result<String> {
    let mut env = minijinja::Environment::new();
    env.add_template("prompt", PROMPT_TEMPLATE)
        .map_err(|err| Error::config(format!("prompt template: {err}")))?;
    let template = env
        .get_template("prompt")
        .map_err(|err| Error::config(format!("prompt template: {err}")))?;
    template
        .render(profile)
        .map_err(|err| Error::Request(format!("prompt render: {err}")))
}

fn split_paragraphs(text: &str) -> Option<(String, String)> {
    let mut first = Vec::new();
    let mut second = Vec::new();
    let mut past_delimiter = false;

    for line in text.lines() {
        if !past_delimiter && line.trim() == "---" {
            past_delimiter = true;
            continue;
        }
        if past_delimiter {
            second.push(line);
        } else {
            first.push(line);
        }
    }

    let first = first.join("\n").trim().to_string();
    let second = second.join("\n").trim().to_string();
    if !past_delimiter || first.is_empty() || second.is_empty() {
        return None;
    }
    Some((first, second))
}

fn with_jitter(delay: Duration) -> Duration {
    let factor = 0.8 + rand::random::<f32>() * 0.4;
    delay.mul_f32(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_from(data: &str) -> Result<FallbackTable> {
        FallbackTable::from_csv(csv::Reader::from_reader(data.as_bytes()))
    }

    fn sample_table() -> FallbackTable {
        table_from(
            "answer_f01,answer_f05,answer_f06,paragraph1,paragraph2\n\
             0,0,0,A careful builder.,It dreams of rivers.\n\
             1,2,3,A loud dreamer.,It dreams of stages.\n",
        )
        .expect("table loads")
    }

    #[test]
    fn splits_on_delimiter_line() {
        let (first, second) =
            split_paragraphs("One paragraph.\n---\nAnother paragraph.").expect("splits");
        assert_eq!(first, "One paragraph.");
        assert_eq!(second, "Another paragraph.");
    }

    #[test]
    fn split_tolerates_padding_around_delimiter() {
        let text = "\nFirst bit\nstill first\n  ---  \nsecond bit\n\n";
        let (first, second) = split_paragraphs(text).expect("splits");
        assert_eq!(first, "First bit\nstill first");
        assert_eq!(second, "second bit");
    }

    #[test]
    fn split_rejects_missing_delimiter_or_half() {
        assert!(split_paragraphs("no delimiter here").is_none());
        assert!(split_paragraphs("first\n---\n").is_none());
        assert!(split_paragraphs("---\nsecond").is_none());
    }

    #[test]
    fn fallback_lookup_is_exact_then_default() {
        let table = sample_table();
        assert_eq!(
            table.lookup((1, 2, 3)),
            ("A loud dreamer.", "It dreams of stages.")
        );
        assert_eq!(
            table.lookup((5, 5, 4)),
            ("A careful builder.", "It dreams of rivers.")
        );
    }

    #[test]
    fn fallback_rejects_empty_paragraphs_and_empty_table() {
        assert!(table_from("answer_f01,answer_f05,answer_f06,paragraph1,paragraph2\n").is_err());
        assert!(
            table_from(
                "answer_f01,answer_f05,answer_f06,paragraph1,paragraph2\n0,0,0,, \n"
            )
            .is_err()
        );
    }

    #[test]
    fn status_classification() {
        assert!(classify_status(200).is_none());
        assert!(matches!(classify_status(429), Some(AttemptError::Retry(_))));
        assert!(matches!(classify_status(503), Some(AttemptError::Retry(_))));
        assert!(matches!(
            classify_status(401),
            Some(AttemptError::Fatal(Error::Auth(401)))
        ));
        assert!(matches!(
            classify_status(404),
            Some(AttemptError::Fatal(Error::Request(_)))
        ));
    }

    #[test]
    fn jitter_stays_within_a_fifth() {
        for _ in 0..100 {
            let jittered = with_jitter(Duration::from_secs(1));
            assert!(jittered >= Duration::from_millis(800));
            assert!(jittered <= Duration::from_millis(1200));
        }
    }

    #[test]
    fn prompt_carries_titles_and_contract() {
        let profile = Profile {
            figurine_id: 1371,
            answers: vec![
                ProfileAnswer {
                    question: "F01".to_string(),
                    title: "Quiet Tinkerer".to_string(),
                },
                ProfileAnswer {
                    question: "F06".to_string(),
                    title: "Night Owl".to_string(),
                },
            ],
        };

        let prompt = render_prompt(&profile).expect("renders");
        assert!(prompt.contains("1371"));
        assert!(prompt.contains("F01: Quiet Tinkerer"));
        assert!(prompt.contains("F06: Night Owl"));
        assert!(prompt.contains("separated by a line containing only ---"));
    }
}
