//! The interactive question-answering loop.
//!
//! Each question is cut down to its last words, optionally rewritten into a
//! standalone question using the previous turn, embedded, matched against
//! the index, and answered by the language model from the retrieved chunks.

use std::io::{BufRead, Write};

use crate::{
    embedding::Embedder,
    error::{Error, Result},
    generation::Generator,
    memory::{ConversationMemory, DEFAULT_WINDOW, Turn},
    text_util::{DEFAULT_MAX_WORDS, is_exit_command, truncate_words},
    vector_store::{ScoredChunk, VectorIndex},
};

/// Chunks retrieved per question by default.
pub const DEFAULT_TOP_K: usize = 2;

const ANSWER_INSTRUCTIONS: &str = "Answer the question using only the \
context below. If the context does not contain the answer, say that you \
do not know instead of guessing.";

const CONDENSE_INSTRUCTIONS: &str = "Rewrite the follow-up question so it \
can be understood without the conversation above. Reply with the question \
only.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    /// Chunks retrieved per question.
    pub top_k: usize,
    /// Only the last `max_words` words of a question are used.
    pub max_words: usize,
    /// Turns remembered between questions.
    pub memory_window: usize,
    /// Rewrite follow-ups into standalone questions before retrieval.
    pub condense: bool,
    /// Print where each retrieved chunk came from.
    pub show_sources: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            max_words: DEFAULT_MAX_WORDS,
            memory_window: DEFAULT_WINDOW,
            condense: false,
            show_sources: false,
        }
    }
}

impl ChatConfig {
    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(Error::Config(
                "number of retrieved chunks must be at least 1".to_string(),
            ));
        }
        if self.max_words == 0 {
            return Err(Error::Config(
                "max words must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// The result of one question.
#[derive(Debug, Clone)]
pub struct Answer {
    pub text: String,
    /// Retrieved chunks, best first.
    pub sources: Vec<ScoredChunk>,
}

/// Everything needed to answer questions over one index.
pub struct ChatSession {
    index: VectorIndex,
    embedder: Box<dyn Embedder>,
    generator: Box<dyn Generator>,
    memory: ConversationMemory,
    config: ChatConfig,
}

impl ChatSession {
    /// Fails if the configuration is invalid or if the index was built with
    /// a different embedding model than `embedder`.
    pub fn new(
        index: VectorIndex,
        embedder: Box<dyn Embedder>,
        generator: Box<dyn Generator>,
        config: ChatConfig,
    ) -> Result<Self> {
        config.validate()?;
        check_embedder(&index, embedder.as_ref())?;

        Ok(Self {
            index,
            embedder,
            generator,
            memory: ConversationMemory::new(config.memory_window),
            config,
        })
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    /// Answer one question and remember the exchange.
    pub fn ask(&mut self, question: &str) -> Result<Answer> {
        let question = truncate_words(question, self.config.max_words);
        if question.is_empty() {
            return Err(Error::Config("question is empty".to_string()));
        }

        let standalone = if self.config.condense && !self.memory.is_empty() {
            self.condense(&question)?
        } else {
            question.clone()
        };

        let query = self.embedder.embed_query(&standalone)?;
        let sources = self.index.search(&query, self.config.top_k)?;
        tracing::debug!(
            retrieved = sources.len(),
            best = sources.first().map(|s| s.score),
            "retrieved context"
        );

        let prompt =
            answer_prompt(&sources, &self.memory.render(), &standalone);
        let text = self.generator.complete(&prompt)?;

        self.memory.record(Turn {
            question,
            answer: text.clone(),
        });

        Ok(Answer { text, sources })
    }

    fn condense(&mut self, question: &str) -> Result<String> {
        let prompt = format!(
            "{}\n\n{CONDENSE_INSTRUCTIONS}\n\nFollow-up question: {question}\n\
             Standalone question:",
            self.memory.render()
        );
        let rewritten = self.generator.complete(&prompt)?;
        let rewritten = rewritten.trim();

        if rewritten.is_empty() {
            return Ok(question.to_string());
        }
        tracing::debug!(original = question, rewritten, "condensed question");
        Ok(truncate_words(rewritten, self.config.max_words))
    }
}

/// Fail unless `embedder` is the model the index was built with.
pub fn check_embedder(index: &VectorIndex, embedder: &dyn Embedder) -> Result<()> {
    let indexed_with = &index.manifest().model_id;
    if indexed_with != embedder.model_id() {
        return Err(Error::Config(format!(
            "index was built with embedding model {indexed_with} but \
             queries would use {}; re-run ingest or select the same model",
            embedder.model_id()
        )));
    }
    Ok(())
}

/// Assemble the answering prompt from retrieved chunks, the remembered
/// conversation and the question.
pub fn answer_prompt(
    sources: &[ScoredChunk],
    history: &str,
    question: &str,
) -> String {
    let context = sources
        .iter()
        .map(|s| s.chunk.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut prompt = format!("{ANSWER_INSTRUCTIONS}\n\nContext:\n{context}\n\n");
    if !history.is_empty() {
        prompt.push_str("Conversation so far:\n");
        prompt.push_str(history);
        prompt.push_str("\n\n");
    }
    prompt.push_str(&format!("Question: {question}\nAnswer:"));
    prompt
}

/// Run the read-answer loop until EOF or an exit keyword.
///
/// Failed questions are reported on `output` and the loop keeps going; only
/// I/O errors on `input` or `output` end it early.
pub fn run_loop<R: BufRead, W: Write>(
    session: &mut ChatSession,
    mut input: R,
    mut output: W,
) -> Result<()> {
    writeln!(output, "Ready. Ask a question, or type 'exit' to quit.\n")?;

    loop {
        write!(output, "You: ")?;
        output.flush()?;

        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            writeln!(output)?;
            break;
        }

        let question = line.trim();
        if is_exit_command(question) {
            break;
        }
        if question.is_empty() {
            continue;
        }

        match session.ask(question) {
            Ok(answer) => {
                writeln!(output, "\nAgent: {}\n", answer.text)?;
                if session.config().show_sources {
                    for source in &answer.sources {
                        writeln!(
                            output,
                            "  [{:.3}] {} #{}",
                            source.score, source.chunk.source, source.chunk.index
                        )?;
                    }
                    writeln!(output)?;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "question failed");
                writeln!(output, "\nError: {e}\n")?;
            }
        }
    }

    writeln!(output, "Goodbye!")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, collections::VecDeque, rc::Rc};

    use super::*;
    use crate::{
        chunking::{Chunk, ChunkingConfig},
        embedding::HashEmbedder,
        vector_store::{IndexEntry, IndexManifest},
    };

    /// Replays canned answers and records every prompt it receives.
    struct ScriptedGenerator {
        answers: VecDeque<Result<String>>,
        prompts: Rc<RefCell<Vec<String>>>,
    }

    impl Generator for ScriptedGenerator {
        fn complete(&mut self, prompt: &str) -> Result<String> {
            self.prompts.borrow_mut().push(prompt.to_string());
            self.answers
                .pop_front()
                .unwrap_or_else(|| Ok("no more answers".to_string()))
        }
    }

    const DOCS: [(&str, &str); 3] = [
        ("leave.txt", "Employees receive 25 days of annual leave per year."),
        ("remote.txt", "Remote work requires approval from a manager."),
        ("food.txt", "The cafeteria serves pasta every Friday."),
    ];

    fn build_index(dir: &std::path::Path) -> VectorIndex {
        let mut embedder = HashEmbedder::default();
        let entries: Vec<IndexEntry> = DOCS
            .iter()
            .map(|(source, text)| IndexEntry {
                chunk: Chunk {
                    source: source.to_string(),
                    index: 0,
                    text: text.to_string(),
                },
                vector: embedder.embed_query(text).unwrap(),
            })
            .collect();
        let dimension = embedder.dimension().unwrap();
        let manifest = IndexManifest::new(
            embedder.model_id(),
            dimension,
            ChunkingConfig::default(),
        );
        VectorIndex::build(dir, manifest, &entries).unwrap();
        VectorIndex::open(dir).unwrap()
    }

    fn session(
        dir: &std::path::Path,
        answers: Vec<Result<String>>,
        config: ChatConfig,
    ) -> (ChatSession, Rc<RefCell<Vec<String>>>) {
        let prompts = Rc::new(RefCell::new(Vec::new()));
        let generator = ScriptedGenerator {
            answers: answers.into(),
            prompts: Rc::clone(&prompts),
        };
        let session = ChatSession::new(
            build_index(dir),
            Box::new(HashEmbedder::default()),
            Box::new(generator),
            config,
        )
        .unwrap();
        (session, prompts)
    }

    fn run(session: &mut ChatSession, input: &str) -> String {
        let mut output = Vec::new();
        run_loop(session, input.as_bytes(), &mut output).unwrap();
        String::from_utf8(output).unwrap()
    }

    #[test]
    fn ask_retrieves_relevant_context() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut session, prompts) = session(
            tmp.path(),
            vec![Ok("25 days.".to_string())],
            ChatConfig::default(),
        );

        let answer = session.ask("How many days of annual leave?").unwrap();

        assert_eq!(answer.text, "25 days.");
        assert_eq!(answer.sources.len(), DEFAULT_TOP_K);
        assert_eq!(answer.sources[0].chunk.source, "leave.txt");
        assert!(prompts.borrow()[0].contains("25 days of annual leave"));
    }

    #[test]
    fn second_question_sees_previous_turn() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut session, prompts) = session(
            tmp.path(),
            vec![Ok("25 days.".to_string()), Ok("Yes.".to_string())],
            ChatConfig::default(),
        );

        session.ask("How much leave?").unwrap();
        session.ask("Is remote work allowed?").unwrap();

        let prompts = prompts.borrow();
        assert!(!prompts[0].contains("Conversation so far"));
        assert!(prompts[1].contains("Human: How much leave?"));
        assert!(prompts[1].contains("Assistant: 25 days."));
    }

    #[test]
    fn memory_keeps_only_last_turn() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut session, prompts) =
            session(tmp.path(), Vec::new(), ChatConfig::default());

        session.ask("first").unwrap();
        session.ask("second").unwrap();
        session.ask("third").unwrap();

        let last_prompt = &prompts.borrow()[2];
        assert!(last_prompt.contains("Human: second"));
        assert!(!last_prompt.contains("Human: first"));
        assert_eq!(session.memory().turns().count(), 1);
    }

    #[test]
    fn long_questions_keep_final_words() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ChatConfig {
            max_words: 3,
            ..ChatConfig::default()
        };
        let (mut session, prompts) = session(tmp.path(), Vec::new(), config);

        session
            .ask("please ignore all this preamble what about leave")
            .unwrap();

        assert!(prompts.borrow()[0].contains("Question: what about leave\n"));
        assert_eq!(
            session.memory().last().unwrap().question,
            "what about leave"
        );
    }

    #[test]
    fn condense_rewrites_follow_ups() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ChatConfig {
            condense: true,
            ..ChatConfig::default()
        };
        let (mut session, prompts) = session(
            tmp.path(),
            vec![
                Ok("25 days.".to_string()),
                Ok("Does remote work need approval?".to_string()),
                Ok("Yes, from a manager.".to_string()),
            ],
            config,
        );

        session.ask("How much annual leave?").unwrap();
        let answer = session.ask("and working from home?").unwrap();

        let prompts = prompts.borrow();
        assert_eq!(prompts.len(), 3);
        assert!(prompts[1].contains("Follow-up question: and working from home?"));
        assert!(prompts[2].contains("Question: Does remote work need approval?"));
        assert_eq!(answer.sources[0].chunk.source, "remote.txt");
    }

    #[test]
    fn mismatched_embedding_model_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let index = build_index(tmp.path());

        struct OtherEmbedder;
        impl Embedder for OtherEmbedder {
            fn model_id(&self) -> &str {
                "other/model"
            }
            fn dimension(&mut self) -> Result<usize> {
                Ok(256)
            }
            fn embed(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
                Ok(vec![vec![0.0; 256]; texts.len()])
            }
        }

        let generator = ScriptedGenerator {
            answers: VecDeque::new(),
            prompts: Rc::default(),
        };
        let result = ChatSession::new(
            index,
            Box::new(OtherEmbedder),
            Box::new(generator),
            ChatConfig::default(),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn loop_answers_until_exit() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut session, prompts) = session(
            tmp.path(),
            vec![Ok("25 days.".to_string())],
            ChatConfig::default(),
        );

        let output = run(&mut session, "How much leave?\nEXIT\nnever asked\n");

        assert!(output.contains("You: "));
        assert!(output.contains("Agent: 25 days."));
        assert!(output.trim_end().ends_with("Goodbye!"));
        assert_eq!(prompts.borrow().len(), 1);
    }

    #[test]
    fn exit_keyword_skips_retrieval() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut session, prompts) =
            session(tmp.path(), Vec::new(), ChatConfig::default());

        let output = run(&mut session, "  Quit  \n");

        assert!(output.contains("Goodbye!"));
        assert!(prompts.borrow().is_empty());
        assert!(session.memory().is_empty());
    }

    #[test]
    fn eof_ends_loop_cleanly() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut session, prompts) =
            session(tmp.path(), Vec::new(), ChatConfig::default());

        let output = run(&mut session, "");

        assert!(output.contains("Goodbye!"));
        assert!(prompts.borrow().is_empty());
    }

    #[test]
    fn blank_lines_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut session, prompts) =
            session(tmp.path(), Vec::new(), ChatConfig::default());

        run(&mut session, "\n   \n\t\nexit\n");

        assert!(prompts.borrow().is_empty());
    }

    #[test]
    fn errors_are_reported_and_loop_continues() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut session, _prompts) = session(
            tmp.path(),
            vec![
                Err(Error::Generation("context overflow".to_string())),
                Ok("Recovered.".to_string()),
            ],
            ChatConfig::default(),
        );

        let output = run(&mut session, "first\nsecond\nexit\n");

        assert!(output.contains("Error: generation error: context overflow"));
        assert!(output.contains("Agent: Recovered."));
        // The failed question is not remembered.
        assert_eq!(session.memory().last().unwrap().question, "second");
    }

    #[test]
    fn show_sources_lists_retrieved_chunks() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ChatConfig {
            show_sources: true,
            ..ChatConfig::default()
        };
        let (mut session, _prompts) =
            session(tmp.path(), vec![Ok("25 days.".to_string())], config);

        let output = run(&mut session, "annual leave days\nexit\n");

        assert!(output.contains("leave.txt #0"));
    }

    #[test]
    fn invalid_config_is_rejected() {
        assert!(ChatConfig {
            top_k: 0,
            ..ChatConfig::default()
        }
        .validate()
        .is_err());
        assert!(ChatConfig {
            max_words: 0,
            ..ChatConfig::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn prompt_without_history_has_no_conversation_block() {
        let prompt = answer_prompt(&[], "", "What?");
        assert!(prompt.starts_with(ANSWER_INSTRUCTIONS));
        assert!(!prompt.contains("Conversation so far"));
        assert!(prompt.ends_with("Question: What?\nAnswer:"));
    }
}
