//! Scripted capabilities for specific scenarios.

use cp_core::capability::ScriptedCapability;
use cp_protocol::Stage;
use serde_json::json;

/// Two persona candidates; only the second mentions the target keywords.
pub fn personas_with_one_match() -> ScriptedCapability {
    ScriptedCapability::new().with_output(
        Stage::PersonaGeneration,
        json!([
            {
                "id": 0,
                "name": "Urban renter",
                "description": "Rents an apartment in Tokyo and reads about interior design",
            },
            {
                "id": 1,
                "name": "Hokkaido family",
                "description": "Plans a 注文住宅 in 札幌 within two years",
            }
        ]),
    )
}

/// Two themes; the second is the better keyword match.
pub fn two_themes() -> ScriptedCapability {
    ScriptedCapability::new().with_output(
        Stage::ThemeGeneration,
        json!([
            { "title": "Interior trends", "description": "Colors and furniture", "keywords": [] },
            {
                "title": "札幌の注文住宅ガイド",
                "description": "Building a custom home in 札幌",
                "keywords": ["札幌", "注文住宅"],
            }
        ]),
    )
}

/// An outline with no sections at all.
pub fn empty_outline() -> ScriptedCapability {
    ScriptedCapability::new().with_output(
        Stage::OutlineGeneration,
        json!({ "title": "Empty", "top_level_heading": 2, "sections": [] }),
    )
}
