//! A short scripted conversation through the full engine.
//!
//! Two keyword sources score each line, the engine clusters the turn and
//! recalls fragments, and a simulated user rates the previous reply. The run
//! holds the writer lock on a temporary store directory, flushes at the end and
//! loads the stores back.
//!
//! ```bash
//! RUST_LOG=resonance_core=debug cargo run --example conversation
//! ```

use rand::rngs::StdRng;
use rand::SeedableRng;
use resonance_core::persist::StoreDirectory;
use resonance_core::reference::{lexical_profile, KeywordSource};
use resonance_core::{AuxiliarySignals, Conversation, EngineConfig, SignalSource, SignatureLayout, SourceSpec, TurnInput};
use tracing_subscriber::EnvFilter;

const LINES: [&str; 8] = [
    "Thanks, that was great!",
    "I'm so tired and alone tonight.",
    "Thanks again, I love this.",
    "I never feel rested. I'm tired.",
    "Great, that helps.",
    "Alone again. Nothing works.",
    "Thanks, great chat.",
    "Tired. Alone.",
];

const REPLIES: [&str; 4] = [
    "That's good to hear.",
    "That sounds heavy. I'm here.",
    "Tell me more.",
    "What would help right now?",
];

fn sources() -> Vec<Box<dyn SignalSource>> {
    vec![
        Box::new(KeywordSource::new("warmth", &["thanks", "great", "love", "helps"], 0.4, 0.2)),
        Box::new(KeywordSource::new("distress", &["alone", "tired", "never", "nothing"], 0.5, -0.15)),
    ]
}

/// Rates a reply the way a consistent user might: comfort for distress, cheer otherwise.
fn rate(line: &str, reply: &str) -> f32 {
    let distressed = ["tired", "alone", "never", "nothing"]
        .iter()
        .any(|w| line.to_lowercase().contains(w));
    let comforting = reply.contains("here") || reply.contains("help");
    match (distressed, comforting) {
        (true, true) | (false, false) => 0.9,
        _ => 0.2,
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = EngineConfig::default();
    let specs: Vec<SourceSpec> = sources().iter().map(|s| s.spec().clone()).collect();
    let dir = tempfile::tempdir()?;
    let store = StoreDirectory::new(dir.path(), &SignatureLayout::from_config(&config.convergence));
    let writer = store.open_writer(&config, &specs)?;
    let stores = writer.stores().clone();
    let mut conversation = Conversation::new(config.clone(), sources(), stores.clone())?.with_retrieval(4, 0.1);
    let defaults: Vec<String> = REPLIES.iter().map(|r| r.to_string()).collect();
    let mut rng = StdRng::seed_from_u64(42);

    let mut previous: Option<(&str, String)> = None;
    for round in 0..3_u64 {
        for (i, line) in LINES.iter().enumerate() {
            let turn = round * LINES.len() as u64 + i as u64;
            let feedback = previous.as_ref().map(|(l, r)| rate(l, r));
            let aux = AuxiliarySignals::default().with_lexical(lexical_profile(line));
            let report = conversation.process_turn(&TurnInput::new(turn, *line), feedback, &aux, &defaults)?;

            let reply = match conversation.select(&report.retrieval, &mut rng) {
                Some(c) => c.fragment.clone(),
                None => defaults[0].clone(),
            };
            conversation.emit(&reply);

            println!(
                "turn {turn:>2} | family {:>4} | cycles {} | {:<34} -> {}",
                report.assignment.family_id.map_or("-".to_string(), |id| id.to_string()),
                report.outcome.cycle_count(),
                line,
                reply
            );
            previous = Some((*line, reply));
        }
    }

    let d = stores.cluster_diagnostics();
    println!(
        "\n{} families, {} assignments, max share {:.2}, threshold {:.2}",
        d.family_count, d.total_assignments, d.max_family_share, d.threshold
    );
    println!(
        "coupling warmth~distress = {:.3}",
        stores.coupling.lock().strength("warmth", "distress").unwrap_or(0.0)
    );

    writer.flush()?;
    drop(writer);
    let reloaded = store.load_all(&config, &specs)?;
    println!(
        "reloaded {} families and {} patterns from {}",
        reloaded.families.lock().len(),
        reloaded.patterns.lock().len(),
        dir.path().display()
    );
    Ok(())
}
