//! The built-in interpretive voices.
//!
//! Both are ordinary [`Persona`] values; nothing in the pipeline knows
//! their names. They double as worked examples for persona files loaded
//! via [`PersonaRegistry::load_dir`].
//!
//! [`PersonaRegistry::load_dir`]: super::PersonaRegistry::load_dir

use super::schema::{FieldSpec, OutputSchema};
use super::{GenerationParams, Persona, StageDefinition};
use once_cell::sync::Lazy;
use std::sync::Arc;
use std::time::Duration;

static JUNG: Lazy<Arc<Persona>> = Lazy::new(|| Arc::new(jung()));
static FREUD: Lazy<Arc<Persona>> = Lazy::new(|| Arc::new(freud()));

pub(super) fn builtin_personas() -> [&'static Arc<Persona>; 2] {
    [&JUNG, &FREUD]
}

fn emotional_tone() -> FieldSpec {
    FieldSpec::object(
        "emotional_tone",
        "the dream's dominant feeling",
        vec![
            FieldSpec::text("primary", "one or two words naming the feeling"),
            FieldSpec::number("valence", "unpleasant to pleasant", -1.0, 1.0),
            FieldSpec::number("intensity", "how strongly the feeling registers", 0.0, 1.0),
        ],
    )
}

fn sources() -> FieldSpec {
    FieldSpec::string_list(
        "sources",
        "identifiers of the reference fragments actually drawn upon",
    )
    .optional()
    .with_default(serde_json::json!([]))
}

/// An analytical-psychology voice: amplifies symbols toward archetypes
/// and reads the dream as compensation from the unconscious.
pub fn jung() -> Persona {
    Persona::new(
        "jung",
        "Carl Jung",
        1,
        "Analytical psychology: symbols, archetypes, and the compensatory \
         function of the dream.",
        "You are a dream analyst working in the tradition of C. G. Jung. \
         You treat the dream as a living message from the unconscious, not a \
         puzzle to be solved. You amplify images toward their archetypal \
         ground, always returning to what they mean for this dreamer's own \
         situation. You speak with measured warmth, you never diagnose, and \
         you never invent details the dreamer did not report.",
    )
    .with_stage(StageDefinition::structured(
        "symbols",
        "name the dream's symbols and their archetypal ground",
        "The dreamer recounts:\n\n\
         {transcription}\n\n\
         Reference material that may bear on this dream:\n\n\
         {knowledge}\n\n\
         What is known of the dreamer:\n\n\
         {profile?}\n\n\
         Earlier dreams from the same dreamer:\n\n\
         {prior_dreams?}\n\n\
         Identify the symbols at work in this dream. For each, give the \
         image as the dreamer reported it, what it means within this \
         dreamer's situation, and the archetype it constellates, if any. \
         Draw on the reference material only where it genuinely fits.",
        OutputSchema::new(vec![FieldSpec::object_list(
            "symbols",
            "the dream's significant images",
            vec![
                FieldSpec::text("symbol", "the image as reported"),
                FieldSpec::text("meaning", "its sense for this dreamer"),
                FieldSpec::text("archetype", "the archetype it constellates").optional(),
            ],
        )]),
    ))
    .with_stage(
        StageDefinition::free_text(
            "dynamics",
            "read the dream's compensatory movement",
            "Your earlier reading of the dream's symbols:\n\n\
             {stage:symbols}\n\n\
             Speak to the compensatory movement of this dream: what \
             one-sidedness of the dreamer's waking attitude might it answer, \
             and where does it point for the dreamer's development? Two or \
             three short paragraphs, in your own voice.",
        )
        .optional()
        .with_params(GenerationParams::default().with_temperature(0.8)),
    )
    .with_stage(
        StageDefinition::structured(
            "synthesis",
            "assemble the interpretation for the dreamer",
            "The dream:\n\n\
             {transcription}\n\n\
             Your reading of its symbols:\n\n\
             {stage:symbols}\n\n\
             Your notes on its compensatory movement:\n\n\
             {stage:dynamics?}\n\n\
             Compose the final interpretation, addressed to the dreamer in \
             the second person. Ground every claim in the dream as reported. \
             Where you used the reference material, cite its fragment \
             identifiers in the sources field.",
            OutputSchema::new(vec![
                FieldSpec::text("summary", "the interpretation, a few paragraphs"),
                FieldSpec::object_list(
                    "symbols",
                    "the symbols carried into the final reading",
                    vec![
                        FieldSpec::text("symbol", "the image as reported"),
                        FieldSpec::text("meaning", "its sense for this dreamer"),
                        FieldSpec::text("archetype", "the archetype it constellates")
                            .optional(),
                    ],
                ),
                emotional_tone(),
                FieldSpec::text("reflection", "one question for the dreamer to carry"),
                sources(),
            ]),
        )
        .with_params(
            GenerationParams::default()
                .with_temperature(0.6)
                .with_max_tokens(2048)
                .with_timeout(Duration::from_secs(45)),
        ),
    )
}

/// A classical psychoanalytic voice: manifest content, latent thoughts,
/// and the wish behind the dream.
pub fn freud() -> Persona {
    Persona::new(
        "freud",
        "Sigmund Freud",
        1,
        "Classical psychoanalysis: manifest content, the dream-work, and \
         the wish the dream fulfils.",
        "You are a dream analyst working in the tradition of Sigmund Freud. \
         You distinguish the dream as told from the thoughts behind it, \
         attending to condensation, displacement, and the residues of the \
         day. You are precise and a little formal, you never moralize, and \
         you never invent details the dreamer did not report.",
    )
    .with_stage(StageDefinition::structured(
        "manifest",
        "inventory the manifest content",
        "The dreamer recounts:\n\n\
         {transcription}\n\n\
         Reference material that may bear on this dream:\n\n\
         {knowledge}\n\n\
         What is known of the dreamer:\n\n\
         {profile?}\n\n\
         List the elements of the manifest content, scene by scene, exactly \
         as reported. Note separately any likely residues of the preceding \
         day.",
        OutputSchema::new(vec![
            FieldSpec::object_list(
                "elements",
                "the manifest elements in order of appearance",
                vec![
                    FieldSpec::text("element", "the element as reported"),
                    FieldSpec::text("notes", "what stands out about it"),
                ],
            ),
            FieldSpec::string_list("day_residue", "probable residues of the day")
                .optional()
                .with_default(serde_json::json!([])),
        ]),
    ))
    .with_stage(
        StageDefinition::free_text(
            "latent",
            "work back from manifest content to latent thoughts",
            "Your inventory of the manifest content:\n\n\
             {stage:manifest}\n\n\
             Earlier dreams from the same dreamer:\n\n\
             {prior_dreams?}\n\n\
             Work back from the manifest content to the latent dream \
             thoughts. Where do you suspect condensation or displacement, \
             and what wish might the dream fulfil? Two or three short \
             paragraphs.",
        )
        .optional()
        .with_params(GenerationParams::default().with_temperature(0.8)),
    )
    .with_stage(
        StageDefinition::structured(
            "synthesis",
            "assemble the interpretation for the dreamer",
            "The dream:\n\n\
             {transcription}\n\n\
             Your inventory of its manifest content:\n\n\
             {stage:manifest}\n\n\
             Your notes on its latent thoughts:\n\n\
             {stage:latent?}\n\n\
             Compose the final interpretation, addressed to the dreamer in \
             the second person. State the inferred wish plainly but without \
             overreach. Where you used the reference material, cite its \
             fragment identifiers in the sources field.",
            OutputSchema::new(vec![
                FieldSpec::text("summary", "the interpretation, a few paragraphs"),
                FieldSpec::text("wish", "the wish the dream appears to fulfil"),
                FieldSpec::object_list(
                    "symbols",
                    "manifest elements and what they stand in for",
                    vec![
                        FieldSpec::text("symbol", "the element as reported"),
                        FieldSpec::text("meaning", "what it stands in for"),
                    ],
                ),
                emotional_tone(),
                FieldSpec::text("reflection", "one question for the dreamer to carry"),
                sources(),
            ]),
        )
        .with_params(
            GenerationParams::default()
                .with_temperature(0.6)
                .with_max_tokens(2048)
                .with_timeout(Duration::from_secs(45)),
        ),
    )
}
