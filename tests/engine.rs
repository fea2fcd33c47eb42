use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use askmynotes::classify::{classify, ConfidencePolicy};
use askmynotes::config::Config;
use askmynotes::engine::AnswerEngine;
use askmynotes::error::EngineError;
use askmynotes::models::{AnswerStyle, Confidence, HistoryTurn, Query};
use askmynotes::store::Upload;
use askmynotes::synthesize::{
    synthesize_grounded, ExtractiveSynthesizer, Synthesis, SynthesisRequest, Synthesizer,
    INSUFFICIENT_INFORMATION,
};

const PHOTOSYNTHESIS: &str = "Photosynthesis occurs in chloroplasts. \
Chlorophyll absorbs light energy and the plant converts carbon dioxide and water into glucose. \
Oxygen is released as a by-product.";

const RESPIRATION: &str = "Cellular respiration happens in the mitochondria. \
Glucose is broken down to release energy stored as ATP.";

const CSS: &str = "# Selectors\n\nCSS selectors target elements by tag, class or id.\n\n\
# Flexbox\n\nFlexbox arranges items along a main axis and a cross axis.";

fn engine() -> AnswerEngine {
    AnswerEngine::in_memory(&Config::default()).unwrap()
}

fn text(name: &str, body: &str) -> Upload {
    Upload::new(name, body.as_bytes().to_vec())
}

async fn seeded() -> AnswerEngine {
    let engine = engine();
    engine.ingest("Biology", text("photosynthesis.txt", PHOTOSYNTHESIS)).await.unwrap();
    engine.ingest("Biology", text("respiration.txt", RESPIRATION)).await.unwrap();
    engine.ingest("Web Design", text("css.md", CSS)).await.unwrap();
    engine
}

#[tokio::test]
async fn retrieval_never_leaves_the_subject() {
    let engine = seeded().await;
    for question in ["What are CSS selectors?", "What is photosynthesis?", "energy glucose flexbox"] {
        for subject in ["Biology", "Web Design"] {
            let result = engine.retrieve(subject, question).await.unwrap();
            assert!(result.items.iter().all(|i| i.passage.subject_id == subject));
        }
    }
}

#[tokio::test]
async fn retrieval_is_deterministic() {
    let engine = seeded().await;
    let first = engine.retrieve("Biology", "How is glucose energy made?").await.unwrap();
    let second = engine.retrieve("Biology", "How is glucose energy made?").await.unwrap();
    let key = |r: &askmynotes::models::RetrievalResult| -> Vec<(String, String)> {
        r.items
            .iter()
            .map(|i| (i.passage.id.clone(), format!("{:.12}", i.score)))
            .collect()
    };
    assert!(!first.is_empty());
    assert_eq!(key(&first), key(&second));
}

#[tokio::test]
async fn photosynthesis_round_trip() {
    let engine = engine();
    let doc = engine
        .ingest("Biology", text("bio.txt", PHOTOSYNTHESIS))
        .await
        .unwrap();

    let result = engine.retrieve("Biology", "What is photosynthesis?").await.unwrap();
    assert!(result
        .items
        .iter()
        .any(|i| i.passage.document_id == doc.id && i.score > 0.0));
}

#[tokio::test]
async fn subject_without_documents_is_unknown() {
    let engine = seeded().await;
    let err = engine.retrieve("Philosophy", "What is ethics?").await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownSubject(ref s) if s == "Philosophy"));

    let err = engine
        .ask(&Query::new("Philosophy", "What is ethics?"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownSubject(_)));
}

#[tokio::test]
async fn binary_garbage_leaves_the_subject_unchanged() {
    let engine = seeded().await;
    let before = engine.store().passages_for("Web Design").len();

    let garbage: Vec<u8> = (0u8..=255).rev().cycle().take(4096).collect();
    let err = engine
        .ingest("Web Design", Upload::new("blob.bin", garbage))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::UnsupportedFormat(_) | EngineError::EmptyDocument(_)
    ));

    let err = engine
        .ingest("Web Design", text("blank.txt", " \n\t \n"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::EmptyDocument(_)));

    assert_eq!(engine.store().passages_for("Web Design").len(), before);
    assert_eq!(engine.documents("Web Design").unwrap().len(), 1);
}

#[tokio::test]
async fn batch_reports_failures_per_file() {
    let engine = engine();
    let outcomes = engine
        .ingest_batch(
            "Biology",
            vec![
                text("good.txt", PHOTOSYNTHESIS),
                Upload::new("photo.png", vec![0x89, b'P', b'N', b'G']),
                text("also-good.txt", RESPIRATION),
            ],
        )
        .await
        .unwrap();

    let ok: Vec<bool> = outcomes.iter().map(|o| o.result.is_ok()).collect();
    assert_eq!(ok, vec![true, false, true]);
    assert!(outcomes[0]
        .preview
        .as_deref()
        .unwrap()
        .starts_with("Photosynthesis occurs"));
    assert!(outcomes[1].preview.is_none());
    assert_eq!(engine.documents("Biology").unwrap().len(), 2);
}

#[tokio::test]
async fn removal_is_visible_to_the_next_retrieval() {
    let engine = engine();
    let first = engine
        .ingest("Biology", text("a.txt", PHOTOSYNTHESIS))
        .await
        .unwrap();
    let second = engine
        .ingest("Biology", text("b.txt", "Photosynthesis needs sunlight and water."))
        .await
        .unwrap();

    engine.remove(&first.id).await.unwrap();
    let result = engine.retrieve("Biology", "photosynthesis").await.unwrap();
    assert!(!result.is_empty());
    assert!(result.items.iter().all(|i| i.passage.document_id == second.id));

    engine.remove(&second.id).await.unwrap();
    assert!(matches!(
        engine.retrieve("Biology", "photosynthesis").await,
        Err(EngineError::UnknownSubject(_))
    ));
    assert!(matches!(
        engine.remove(&second.id).await,
        Err(EngineError::DocumentNotFound(_))
    ));
}

#[tokio::test]
async fn unrelated_question_gets_the_fixed_answer_and_low() {
    let engine = seeded().await;
    let retrieval = engine
        .retrieve("Biology", "Who won the 1998 football world cup?")
        .await
        .unwrap();
    assert!(retrieval.is_empty());

    let synth = ExtractiveSynthesizer::new(3, 3);
    let request = SynthesisRequest {
        question: "Who won the 1998 football world cup?",
        retrieval: &retrieval,
        style: AnswerStyle::Concise,
        history: &[],
    };
    let synthesis = synthesize_grounded(&synth, &request, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(synthesis.answer, INSUFFICIENT_INFORMATION);
    let classification = classify(&synthesis.trace, &retrieval, &ConfidencePolicy::default());
    assert_eq!(classification.confidence, Confidence::Low);
    assert!(classification.citations.is_empty());

    let record = engine
        .ask(&Query::new("Biology", "Who won the 1998 football world cup?"))
        .await
        .unwrap();
    assert_eq!(record.answer, INSUFFICIENT_INFORMATION);
    assert_eq!(record.confidence, Confidence::Low);
    assert!(record.evidence.is_empty());
}

#[tokio::test]
async fn citations_come_from_the_retrieval_and_labels_are_consistent() {
    let engine = seeded().await;
    let policy = ConfidencePolicy::default();
    let questions = [
        "What is photosynthesis?",
        "Where does photosynthesis occur in chloroplasts?",
        "How does glucose release energy as ATP?",
        "What does chlorophyll absorb?",
    ];

    for question in questions {
        let retrieval = engine.retrieve("Biology", question).await.unwrap();
        let synth = ExtractiveSynthesizer::new(3, 3);
        let request = SynthesisRequest {
            question,
            retrieval: &retrieval,
            style: AnswerStyle::Concise,
            history: &[],
        };
        let synthesis = synthesize_grounded(&synth, &request, Duration::from_secs(5))
            .await
            .unwrap();
        let out = classify(&synthesis.trace, &retrieval, &policy);

        for citation in &out.citations {
            assert!(retrieval.contains(&citation.passage_id), "{}", question);
        }
        for evidence in &out.evidence {
            assert!(evidence.snippet.chars().count() <= policy.snippet_chars);
        }

        match out.confidence {
            Confidence::High => {
                let mut strong: Vec<&str> = synthesis
                    .trace
                    .claims
                    .iter()
                    .flat_map(|c| c.support.iter())
                    .filter_map(|id| retrieval.get(id))
                    .filter(|i| i.score > policy.strong_threshold)
                    .map(|i| i.passage.document_id.as_str())
                    .collect();
                strong.sort();
                strong.dedup();
                assert!(strong.len() >= 2, "{}", question);
            }
            Confidence::Low => {
                assert!(synthesis
                    .trace
                    .claims
                    .iter()
                    .any(|c| !c.support.iter().any(|id| retrieval.contains(id))));
            }
            Confidence::Medium => {}
        }
    }
}

#[tokio::test]
async fn answers_carry_evidence_from_the_notes() {
    let engine = seeded().await;
    let record = engine
        .ask(&Query::new("Biology", "Where does photosynthesis occur?"))
        .await
        .unwrap();
    assert!(record.answer.contains("Photosynthesis occurs in chloroplasts."));
    assert_ne!(record.confidence, Confidence::Low);
    assert_eq!(record.citations[0].file, "photosynthesis.txt");
    assert_eq!(record.evidence[0].citation.label(), "photosynthesis.txt | passage 1");
}

#[tokio::test]
async fn overlapping_windows_of_one_note_are_not_high_confidence() {
    let mut config = Config::default();
    config.chunking.max_words = 12;
    config.chunking.overlap_words = 6;
    let engine = AnswerEngine::in_memory(&config).unwrap();
    engine
        .ingest(
            "Biology",
            text(
                "mitosis.txt",
                "Intro words filler filler filler filler filler. \
                 Mitosis yields two daughter cells. \
                 Other stuff filler filler filler filler.",
            ),
        )
        .await
        .unwrap();

    let record = engine
        .ask(&Query::new("Biology", "What does mitosis yield?"))
        .await
        .unwrap();
    assert!(record.answer.contains("Mitosis yields two daughter cells."));
    assert!(record.citations.len() >= 2);
    assert!(record
        .citations
        .iter()
        .all(|c| c.document_id == record.citations[0].document_id));
    assert_eq!(record.confidence, Confidence::Medium);
}

#[tokio::test]
async fn teacher_reply_ends_with_a_question() {
    let engine = seeded().await;
    let history = vec![HistoryTurn {
        role: "user".into(),
        content: "What is photosynthesis?".into(),
    }];
    let record = engine
        .ask(
            &Query::new("Biology", "simplify it")
                .with_history(history)
                .with_style(AnswerStyle::Teacher),
        )
        .await
        .unwrap();
    assert!(record.answer.starts_with("Here's what your notes say:"));
    assert!(record.answer.ends_with('?'));
    assert!(!record.citations.is_empty());
}

#[tokio::test]
async fn empty_question_is_rejected() {
    let engine = seeded().await;
    assert!(matches!(
        engine.ask(&Query::new("Biology", "   ")).await,
        Err(EngineError::EmptyQuestion)
    ));
}

struct Stalled;

#[async_trait]
impl Synthesizer for Stalled {
    fn name(&self) -> &str {
        "stalled"
    }

    async fn synthesize(
        &self,
        _request: &SynthesisRequest<'_>,
    ) -> askmynotes::error::Result<Synthesis> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(Synthesis::insufficient())
    }
}

#[tokio::test]
async fn slow_synthesis_times_out_without_an_answer() {
    let engine = seeded()
        .await
        .with_synthesizer(Arc::new(Stalled))
        .with_timeout(Duration::from_millis(50));
    let err = engine
        .ask(&Query::new("Biology", "What is photosynthesis?"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Timeout(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn readers_never_see_a_partial_ingest() {
    let mut config = Config::default();
    config.chunking.max_words = 12;
    config.chunking.overlap_words = 3;
    let engine = Arc::new(AnswerEngine::in_memory(&config).unwrap());
    engine
        .ingest("Biology", text("seed.txt", PHOTOSYNTHESIS))
        .await
        .unwrap();

    let writer = {
        let engine = engine.clone();
        tokio::spawn(async move {
            for i in 0..20 {
                let body = format!("{} {} Note number {}.", PHOTOSYNTHESIS, RESPIRATION, i);
                engine
                    .ingest("Biology", text(&format!("n{}.txt", i), &body))
                    .await
                    .unwrap();
            }
        })
    };

    let reader = {
        let engine = engine.clone();
        tokio::spawn(async move {
            for _ in 0..200 {
                let snapshot = engine.store().snapshot("Biology").unwrap();
                for doc in &snapshot.documents {
                    let n = snapshot
                        .passages
                        .iter()
                        .filter(|p| p.document_id == doc.id)
                        .count();
                    assert_eq!(n, doc.passage_count);
                }
                engine.retrieve("Biology", "photosynthesis").await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    writer.await.unwrap();
    reader.await.unwrap();
    assert_eq!(engine.documents("Biology").unwrap().len(), 21);
}
