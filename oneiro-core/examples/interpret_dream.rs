//! Interpret one dream end to end and print the result.
//!
//! Runs against scripted mocks by default, so it works offline. Set
//! ANTHROPIC_API_KEY to run the same pipeline against the real API.
//!
//! Run with: `cargo run -p oneiro-core --example interpret_dream`

use oneiro_core::testing::{sample_fragment, MockGenerator, MockSimilarity};
use oneiro_core::{
    ClaudeGenerator, DreamContext, GenerationClient, InterpretationService, JsonFileStore,
    OwnerId, PersonaRegistry, ServiceConfig,
};
use serde_json::json;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();

    let flying = sample_fragment(
        "flying",
        "Flight in dreams often carries the wish to rise above a situation \
         that has grown too heavy to face directly.",
    );
    let ocean = sample_fragment(
        "ocean",
        "The sea is an old image of the unconscious: vast, sustaining, and \
         indifferent to the swimmer's plans.",
    );

    let generator: Arc<dyn GenerationClient> = match ClaudeGenerator::from_env() {
        Ok(live) => {
            println!("ANTHROPIC_API_KEY found; using the real API.");
            Arc::new(live)
        }
        Err(_) => {
            println!("No ANTHROPIC_API_KEY; using scripted replies.");
            Arc::new(scripted_jung_replies(&flying, &ocean))
        }
    };

    let similarity = MockSimilarity::new()
        .with_fragments("flying", vec![(flying, 0.9)])
        .with_fragments("ocean", vec![(ocean, 0.85)]);

    let service = InterpretationService::new(
        PersonaRegistry::with_builtins(),
        generator,
        Arc::new(similarity),
        ServiceConfig::default(),
    )
    .with_store(Arc::new(JsonFileStore::new("interpretations")));

    println!("\n{}", "=".repeat(60));
    println!("Available personas");
    println!("{}", "=".repeat(60));
    for persona in service.list_personas() {
        println!(
            "  {} v{} ({}): {}",
            persona.code,
            persona.version,
            persona.stages.join(" -> "),
            persona.name
        );
    }

    let context = DreamContext::new(
        OwnerId::new(),
        "I was flying over a vast ocean. The water was dark but I was not afraid.",
    )
    .with_theme("flying", 0.8)
    .with_theme("ocean", 0.6);

    println!("\n{}", "=".repeat(60));
    println!("Interpreting as: jung");
    println!("{}", "=".repeat(60));

    let result = service.interpret_dream(context, "jung").await?;

    println!("\nstatus: {:?}", result.status);
    for stage in &result.stages {
        println!(
            "  stage {} -> {} ({} attempts, {} ms)",
            stage.stage,
            stage.status,
            stage.attempts,
            stage.latency.as_millis()
        );
    }
    for warning in &result.warnings {
        println!("  warning: {warning}");
    }

    println!("\n{}", serde_json::to_string_pretty(&result.payload)?);

    println!(
        "\nfragments retrieved: {}, cited: {}",
        result.fragments_retrieved.len(),
        result.fragments_used.len()
    );
    println!(
        "tokens: {} in, {} out; elapsed {} ms",
        result.usage.input_tokens,
        result.usage.output_tokens,
        result.elapsed.as_millis()
    );
    println!("saved under interpretations/ as result {}", result.result_id);

    Ok(())
}

/// Canned replies matching the jung persona's three stages.
fn scripted_jung_replies(
    flying: &oneiro_core::KnowledgeFragment,
    ocean: &oneiro_core::KnowledgeFragment,
) -> MockGenerator {
    MockGenerator::new()
        .then_text(
            json!({
                "symbols": [
                    {
                        "symbol": "flying",
                        "meaning": "rising above what weighs on you",
                        "archetype": "the spirit"
                    },
                    {
                        "symbol": "the dark ocean",
                        "meaning": "the unconscious in its vastness",
                        "archetype": "the great mother"
                    }
                ]
            })
            .to_string(),
        )
        .then_text(
            "The dream answers a waking attitude that has grown too careful. \
             It lifts you above the water you have been refusing to look at, \
             and lets you see that it carries you either way.\n\n\
             Where the waking mind treats depth as danger, the dream offers \
             height without escape: the ocean stays in view the whole time.",
        )
        .then_text(
            json!({
                "summary": "You are carried above the unconscious, not swallowed by it. \
                            The dream shows the dark water and keeps you moving: what \
                            you fear to examine is also what holds you up.",
                "symbols": [
                    {
                        "symbol": "flying",
                        "meaning": "rising above what weighs on you",
                        "archetype": "the spirit"
                    },
                    {
                        "symbol": "the dark ocean",
                        "meaning": "the unconscious in its vastness",
                        "archetype": "the great mother"
                    }
                ],
                "emotional_tone": {
                    "primary": "calm exhilaration",
                    "valence": 0.7,
                    "intensity": 0.8
                },
                "reflection": "What in waking life asks to be seen from higher ground?",
                "sources": [flying.id.to_string(), ocean.id.to_string()]
            })
            .to_string(),
        )
}
