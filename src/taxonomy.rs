// src/taxonomy.rs
//! Fixed, versioned set of sustainability categories the classifier may emit.

use serde::{Deserialize, Serialize};

/// Bumped whenever a label is added, removed or renamed.
pub const TAXONOMY_VERSION: &str = "2024.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "Art / Design / Culture")]
    ArtDesignCulture,
    #[serde(rename = "Behaviour Change")]
    BehaviourChange,
    #[serde(rename = "Blue Economy")]
    BlueEconomy,
    #[serde(rename = "Biodiversity")]
    Biodiversity,
    #[serde(rename = "Biomimicry")]
    Biomimicry,
    #[serde(rename = "Bioregional")]
    Bioregional,
    #[serde(rename = "Circular / Spiral Economy")]
    CircularSpiralEconomy,
    #[serde(rename = "Climate & Carbon")]
    ClimateCarbon,
    #[serde(rename = "Conservation")]
    Conservation,
    #[serde(rename = "Cradle to Cradle")]
    CradleToCradle,
    #[serde(rename = "Degrowth / Steady State")]
    DegrowthSteadyState,
    #[serde(rename = "Doughnut Economics")]
    DoughnutEconomics,
    #[serde(rename = "Ecocide")]
    Ecocide,
    #[serde(rename = "Ecological Footprint")]
    EcologicalFootprint,
    #[serde(rename = "Ecology / Deep Ecology")]
    EcologyDeepEcology,
    #[serde(rename = "Indigenous")]
    Indigenous,
    #[serde(rename = "Modern Slavery")]
    ModernSlavery,
    #[serde(rename = "Nature")]
    Nature,
    #[serde(rename = "Place-Based / Cities")]
    PlaceBasedCities,
    #[serde(rename = "Planetary Boundaries")]
    PlanetaryBoundaries,
    #[serde(rename = "Regenerative Thinking")]
    RegenerativeThinking,
    #[serde(rename = "Social Justice & DEI")]
    SocialJusticeDei,
    #[serde(rename = "Social Procurement")]
    SocialProcurement,
    #[serde(rename = "Sustainability / ESG / Six Capitals")]
    SustainabilityEsg,
    #[serde(rename = "Symbio(s)cene")]
    Symbioscene,
    #[serde(rename = "Systems Thinking")]
    SystemsThinking,
    #[serde(rename = "Time Horizons")]
    TimeHorizons,
}

impl Category {
    pub const ALL: [Category; 27] = [
        Category::ArtDesignCulture,
        Category::BehaviourChange,
        Category::BlueEconomy,
        Category::Biodiversity,
        Category::Biomimicry,
        Category::Bioregional,
        Category::CircularSpiralEconomy,
        Category::ClimateCarbon,
        Category::Conservation,
        Category::CradleToCradle,
        Category::DegrowthSteadyState,
        Category::DoughnutEconomics,
        Category::Ecocide,
        Category::EcologicalFootprint,
        Category::EcologyDeepEcology,
        Category::Indigenous,
        Category::ModernSlavery,
        Category::Nature,
        Category::PlaceBasedCities,
        Category::PlanetaryBoundaries,
        Category::RegenerativeThinking,
        Category::SocialJusticeDei,
        Category::SocialProcurement,
        Category::SustainabilityEsg,
        Category::Symbioscene,
        Category::SystemsThinking,
        Category::TimeHorizons,
    ];

    pub fn all() -> &'static [Category] {
        &Self::ALL
    }

    /// Human-readable label; identical to the serialized form.
    pub fn label(self) -> &'static str {
        match self {
            Category::ArtDesignCulture => "Art / Design / Culture",
            Category::BehaviourChange => "Behaviour Change",
            Category::BlueEconomy => "Blue Economy",
            Category::Biodiversity => "Biodiversity",
            Category::Biomimicry => "Biomimicry",
            Category::Bioregional => "Bioregional",
            Category::CircularSpiralEconomy => "Circular / Spiral Economy",
            Category::ClimateCarbon => "Climate & Carbon",
            Category::Conservation => "Conservation",
            Category::CradleToCradle => "Cradle to Cradle",
            Category::DegrowthSteadyState => "Degrowth / Steady State",
            Category::DoughnutEconomics => "Doughnut Economics",
            Category::Ecocide => "Ecocide",
            Category::EcologicalFootprint => "Ecological Footprint",
            Category::EcologyDeepEcology => "Ecology / Deep Ecology",
            Category::Indigenous => "Indigenous",
            Category::ModernSlavery => "Modern Slavery",
            Category::Nature => "Nature",
            Category::PlaceBasedCities => "Place-Based / Cities",
            Category::PlanetaryBoundaries => "Planetary Boundaries",
            Category::RegenerativeThinking => "Regenerative Thinking",
            Category::SocialJusticeDei => "Social Justice & DEI",
            Category::SocialProcurement => "Social Procurement",
            Category::SustainabilityEsg => "Sustainability / ESG / Six Capitals",
            Category::Symbioscene => "Symbio(s)cene",
            Category::SystemsThinking => "Systems Thinking",
            Category::TimeHorizons => "Time Horizons",
        }
    }

    /// Exact match after trimming, then an ASCII case-insensitive match.
    pub fn parse(label: &str) -> Option<Category> {
        let t = label.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.label() == t)
            .or_else(|| {
                Self::ALL
                    .iter()
                    .copied()
                    .find(|c| c.label().eq_ignore_ascii_case(t))
            })
    }

    /// Nearest valid label by normalized Levenshtein similarity.
    /// Only used for diagnostics when a label is rejected.
    pub fn closest(label: &str) -> Option<(Category, f64)> {
        let needle = label.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .map(|c| {
                let score = strsim::normalized_levenshtein(&needle, &c.label().to_ascii_lowercase());
                (*c, score)
            })
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// All labels, in taxonomy order, for prompts and diagnostics.
pub fn labels() -> Vec<&'static str> {
    Category::ALL.iter().map(|c| c.label()).collect()
}
