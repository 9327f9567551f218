//! Stage resolution
//!
//! Turns the proxy shape's stage-shaping inputs into a stage, reusing a
//! cached one when an equivalent stage is already open and its file has
//! not changed on disk.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::UsdError;
use crate::usd::{
    InitialLoadSet, Layer, LayerHandle, PopulationMask, SdfPath, Stage, StageCache, StageKey,
};

/// Variant selections to author, per prim: `prim -> {set -> selection}`
pub type VariantSelections = BTreeMap<SdfPath, BTreeMap<String, String>>;

/// Everything needed to open a stage for a proxy shape
#[derive(Debug, Clone, Default)]
pub struct ImportData {
    pub filename: String,
    pub root_prim_path: SdfPath,
    pub population_mask: PopulationMask,
    pub variant_selections: VariantSelections,
    pub load_set: InitialLoadSet,
    pub session_layer: Option<LayerHandle>,
}

impl ImportData {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            root_prim_path: SdfPath::absolute_root(),
            ..Self::default()
        }
    }

    /// Parse `"/prim{set=selection}"` entries. Malformed entries are skipped
    /// with a warning.
    pub fn parse_variant_selections<S: AsRef<str>>(entries: &[S]) -> VariantSelections {
        let mut selections = VariantSelections::new();
        for entry in entries {
            let entry = entry.as_ref().trim();
            match parse_variant_selection(entry) {
                Some((path, set, selection)) => {
                    selections.entry(path).or_default().insert(set, selection);
                }
                None => log::warn!("Ignoring malformed variant selection '{}'", entry),
            }
        }
        selections
    }

    fn stage_key(&self, root_identifier: &str) -> StageKey {
        StageKey {
            root_layer: root_identifier.to_string(),
            session_layer: self
                .session_layer
                .as_ref()
                .map(|layer| layer.identifier().to_string()),
            load: self.load_set,
            mask: self.population_mask.clone(),
        }
    }
}

fn parse_variant_selection(entry: &str) -> Option<(SdfPath, String, String)> {
    let (path, rest) = entry.split_once('{')?;
    let body = rest.strip_suffix('}')?;
    let (set, selection) = body.split_once('=')?;
    let path = SdfPath::new(path.trim()).ok()?;
    let set = set.trim();
    if set.is_empty() || !path.is_prim_path() {
        return None;
    }
    Some((path, set.to_string(), selection.trim().to_string()))
}

/// Opens stages for proxy shapes, sharing them through the stage cache
pub struct StageResolver {
    cache: Arc<StageCache>,
}

impl StageResolver {
    pub fn new(cache: Arc<StageCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<StageCache> {
        &self.cache
    }

    /// Resolve `import` to a stage. With `shared`, a cached stage on the
    /// same file with the same selections is reused, and a newly opened
    /// stage is added to the cache. Cached stages whose file changed on disk
    /// are dropped from the cache. Stages that differ only in their variant
    /// selections live side by side.
    pub fn resolve(&self, import: &ImportData, shared: bool) -> Result<Stage, UsdError> {
        if import.filename.is_empty() {
            return Err(UsdError::InvalidPath(String::new()));
        }

        if shared {
            let key = import.stage_key(&import.filename);
            let mut stale = Vec::new();
            let mut reusable = None;
            for stage in self.cache.find_matching(&key) {
                if stage.root_layer().is_stale_on_disk() {
                    stale.push(stage);
                } else if reusable.is_none() && selections_match(&stage, import) {
                    reusable = Some(stage);
                }
            }
            for stage in &stale {
                log::debug!("Cached stage for {} is out of date", import.filename);
                self.cache.erase_stage(stage);
            }
            if let Some(stage) = reusable {
                log::debug!("Reusing cached stage for {}", import.filename);
                return Ok(stage);
            }
        }

        let root = Layer::open(&import.filename)?;
        let stage = Stage::open_layer(
            root,
            import.session_layer.clone(),
            import.population_mask.clone(),
            import.load_set,
        );
        self.author_variant_selections(&stage, &import.variant_selections)?;

        if shared {
            let id = self.cache.insert(stage.clone());
            log::info!("Opened {} as cached stage {}", import.filename, id);
        } else {
            log::info!("Opened {} unshared", import.filename);
        }
        Ok(stage)
    }

    /// Author selections into the session layer, leaving the edit target
    /// as it was
    fn author_variant_selections(
        &self,
        stage: &Stage,
        selections: &VariantSelections,
    ) -> Result<(), UsdError> {
        if selections.is_empty() {
            return Ok(());
        }
        let previous = stage.edit_target();
        stage.set_edit_target(stage.session_layer())?;
        let result = stage.change_block(|stage| {
            for (path, sets) in selections {
                for (set, selection) in sets {
                    stage.set_variant_selection(path, set, selection)?;
                }
            }
            Ok(())
        });
        stage.set_edit_target(&previous)?;
        result
    }
}

/// True if the selections authored in the stage's session layer are
/// exactly the requested ones
fn selections_match(stage: &Stage, import: &ImportData) -> bool {
    let authored: VariantSelections = stage.session_layer().read(|data| {
        data.paths()
            .filter_map(|path| {
                let spec = data.spec(path)?;
                (!spec.variant_selections.is_empty())
                    .then(|| (path.clone(), spec.variant_selections.clone()))
            })
            .collect()
    });
    authored == import.variant_selections
}
