//! The generation function seam.
//!
//! A [`Generate`] implementation turns a prompt into a lazy, finite stream of
//! text fragments that may fail part-way. Workers own the stream for the
//! duration of one request and never restart it.

use crate::common::{error::GenerationError, types::Prompt};
use async_trait::async_trait;
use core::time::Duration;
use futures::{StreamExt, stream::BoxStream};
use rand::{Rng, seq::IndexedRandom};

/// Lazily produced generation output.
pub type TextStream = BoxStream<'static, core::result::Result<String, GenerationError>>;

/// Opaque text generation function.
#[async_trait]
pub trait Generate: Send + Sync {
    /// Health probe run once per claimed job before any request is started.
    ///
    /// An error here means the whole batch is unprocessable.
    async fn ready(&self) -> core::result::Result<(), GenerationError> {
        Ok(())
    }

    /// Starts generating output for `prompt`.
    fn generate(&self, prompt: &Prompt) -> TextStream;
}

const RESPONSE_LENGTH_FACTOR: usize = 3;
const MIN_RESPONSE_WORDS: usize = 5;

const WORDS: &[&str] = &[
    "the", "a", "an", "in", "on", "with", "for", "to", "from", "text", "response",
    "generation", "process", "system", "model", "input", "output", "data", "information",
    "content", "analysis", "research", "development", "implementation", "solution",
    "approach", "methodology", "framework", "architecture", "design", "optimization",
    "performance", "efficiency", "reliability", "scalability", "integration", "deployment",
    "monitoring", "maintenance", "support",
];

/// Stand-in language model.
///
/// Builds a response of `max(5, 3 * prompt words)` words, half drawn from the
/// prompt (sometimes upper-cased) and half from a fixed vocabulary, adds a
/// closing sentence, and streams it one character at a time.
#[derive(Debug, Clone)]
pub struct MockTextGenerator {
    char_delay: Duration,
    max_word_pause: Duration,
}

impl MockTextGenerator {
    /// `char_delay` is paid before every character; after a space there is a
    /// 30% chance of an extra pause of up to `max_word_pause`.
    #[must_use]
    pub const fn new(char_delay: Duration, max_word_pause: Duration) -> Self {
        Self {
            char_delay,
            max_word_pause,
        }
    }

    /// A generator with no delays, for tests and benchmarks.
    #[must_use]
    pub const fn instant() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    fn compose(&self, prompt: &str) -> Vec<(char, Duration)> {
        let mut rng = rand::rng();
        let words: Vec<&str> = prompt.split_whitespace().collect();
        let count = MIN_RESPONSE_WORDS.max(words.len() * RESPONSE_LENGTH_FACTOR);

        let mut parts: Vec<String> = (0..count)
            .map(|_| match words.choose(&mut rng) {
                Some(word) if rng.random_bool(0.5) => {
                    if rng.random_bool(0.3) {
                        word.to_uppercase()
                    } else {
                        (*word).to_string()
                    }
                }
                _ => WORDS.choose(&mut rng).copied().unwrap_or("the").to_string(),
            })
            .collect();
        if let Some(first) = parts.first_mut() {
            *first = capitalize(first);
        }

        let mut response = parts.join(" ");
        response.push_str(&closing(prompt, &words, &mut rng));

        let max_pause = u64::try_from(self.max_word_pause.as_millis()).unwrap_or(u64::MAX);
        let mut previous = None;
        response
            .chars()
            .map(|ch| {
                let mut delay = self.char_delay;
                if previous == Some(' ') && max_pause > 0 && rng.random_bool(0.3) {
                    delay += Duration::from_millis(rng.random_range(0..=max_pause));
                }
                previous = Some(ch);
                (ch, delay)
            })
            .collect()
    }
}

impl Default for MockTextGenerator {
    fn default() -> Self {
        Self::new(Duration::from_millis(10), Duration::from_millis(200))
    }
}

#[async_trait]
impl Generate for MockTextGenerator {
    fn generate(&self, prompt: &Prompt) -> TextStream {
        // `ThreadRng` is not `Send`, so the whole response is planned up
        // front and only the pacing happens inside the stream.
        let plan = self.compose(prompt.as_str());
        futures::stream::iter(plan)
            .then(|(ch, delay)| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(ch.to_string())
            })
            .boxed()
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

fn closing(prompt: &str, words: &[&str], rng: &mut impl Rng) -> String {
    match rng.random_range(0..3) {
        0 => {
            let head: String = prompt.chars().take(20).collect();
            let ellipsis = if prompt.chars().count() > 20 { "..." } else { "" };
            format!("\n\nBased on your prompt \"{head}{ellipsis}\", this is my response.")
        }
        1 => format!(
            "\n\nI hope this helps with your request about {}.",
            words.first().copied().unwrap_or("this topic")
        ),
        _ => "\n\nThank you for your prompt. This was my generated response.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn streams_one_character_per_fragment() {
        let generator = MockTextGenerator::instant();
        let prompt = Prompt::new("streaming batched text").unwrap();
        let fragments: Vec<String> = generator
            .generate(&prompt)
            .map(|item| item.unwrap())
            .collect()
            .await;

        assert!(fragments.iter().all(|f| f.chars().count() == 1));
        let text: String = fragments.concat();
        let body = text.split("\n\n").next().unwrap();
        assert_eq!(body.split(' ').count(), 9);
        assert!(body.chars().next().unwrap().is_uppercase());
    }

    #[tokio::test]
    async fn short_prompts_get_a_minimum_length_response() {
        let generator = MockTextGenerator::instant();
        let prompt = Prompt::new("hi").unwrap();
        let text: String = generator
            .generate(&prompt)
            .map(|item| item.unwrap())
            .collect::<Vec<_>>()
            .await
            .concat();
        let body = text.split("\n\n").next().unwrap();
        assert_eq!(body.split(' ').count(), MIN_RESPONSE_WORDS);
    }

    #[tokio::test(start_paused = true)]
    async fn delays_are_paid_per_character() {
        let generator = MockTextGenerator::new(Duration::from_millis(10), Duration::ZERO);
        let prompt = Prompt::new("pace me").unwrap();
        let start = tokio::time::Instant::now();
        let count = generator.generate(&prompt).count().await;
        assert!(count > 0);
        assert!(start.elapsed() >= Duration::from_millis(10) * count as u32);
    }

    #[test]
    fn capitalize_first_letter() {
        assert_eq!(capitalize("design"), "Design");
        assert_eq!(capitalize("DATA"), "Data");
        assert_eq!(capitalize(""), "");
    }
}
