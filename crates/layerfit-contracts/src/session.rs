use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::image::ImageRef;
use crate::layers::{canonical_order, capacity_of, Category, SlotPosition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[default]
    Empty,
    Analyzing,
    Ready,
    Generating,
    Done,
    Error,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Empty => "EMPTY",
            Status::Analyzing => "ANALYZING",
            Status::Ready => "READY",
            Status::Generating => "GENERATING",
            Status::Done => "DONE",
            Status::Error => "ERROR",
        }
    }

    /// Statuses during which an orchestration step is still in flight.
    pub fn is_busy(self) -> bool {
        matches!(self, Status::Analyzing | Status::Generating)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "EMPTY" => Ok(Status::Empty),
            "ANALYZING" => Ok(Status::Analyzing),
            "READY" => Ok(Status::Ready),
            "GENERATING" => Ok(Status::Generating),
            "DONE" => Ok(Status::Done),
            "ERROR" => Ok(Status::Error),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

/// Three garment categories at their fixed capacities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outfit {
    pub outer: [Option<ImageRef>; 2],
    pub inner: [Option<ImageRef>; 3],
    pub bottoms: [Option<ImageRef>; 2],
}

impl Outfit {
    pub fn slots(&self, category: Category) -> &[Option<ImageRef>] {
        match category {
            Category::Outer => &self.outer,
            Category::Inner => &self.inner,
            Category::Bottoms => &self.bottoms,
        }
    }

    pub fn slots_mut(&mut self, category: Category) -> &mut [Option<ImageRef>] {
        match category {
            Category::Outer => &mut self.outer,
            Category::Inner => &mut self.inner,
            Category::Bottoms => &mut self.bottoms,
        }
    }

    pub fn get(&self, position: SlotPosition) -> Option<&ImageRef> {
        self.slots(position.category)
            .get(position.index)
            .and_then(Option::as_ref)
    }

    /// Writes a slot, returning the previous value. Out-of-capacity
    /// positions are rejected with `Err` and leave the outfit unchanged.
    pub fn set(
        &mut self,
        position: SlotPosition,
        value: Option<ImageRef>,
    ) -> Result<Option<ImageRef>, String> {
        let capacity = capacity_of(position.category);
        let Some(slot) = self.slots_mut(position.category).get_mut(position.index) else {
            return Err(format!(
                "slot {position} is out of range (capacity {capacity})"
            ));
        };
        Ok(std::mem::replace(slot, value))
    }

    pub fn is_empty(&self) -> bool {
        self.filled_count() == 0
    }

    pub fn filled_count(&self) -> usize {
        Category::ALL
            .iter()
            .map(|category| self.slots(*category).iter().flatten().count())
            .sum()
    }

    /// Filled slots in canonical wearing order, innermost first.
    pub fn layered(&self) -> Vec<(SlotPosition, &ImageRef)> {
        canonical_order()
            .iter()
            .filter_map(|position| self.get(*position).map(|image| (*position, image)))
            .collect()
    }

    /// All positions with their values, category by category.
    pub fn positions(&self) -> impl Iterator<Item = (SlotPosition, Option<&ImageRef>)> {
        Category::ALL.into_iter().flat_map(move |category| {
            self.slots(category)
                .iter()
                .enumerate()
                .map(move |(index, value)| (SlotPosition::new(category, index), value.as_ref()))
        })
    }

    /// Compact per-category presence summary, e.g. `outer[0]:- outer[1]:x`.
    pub fn presence_line(&self, category: Category) -> String {
        self.slots(category)
            .iter()
            .enumerate()
            .map(|(index, slot)| {
                format!("{category}[{index}]:{}", if slot.is_some() { "x" } else { "-" })
            })
            .collect::<Vec<String>>()
            .join(" ")
    }
}

/// The merge law used by every composition: a user override wins,
/// otherwise the baseline detection is used.
pub fn effective_outfit(user: &Outfit, baseline: &Outfit) -> Outfit {
    fn merge<const N: usize>(
        user: &[Option<ImageRef>; N],
        baseline: &[Option<ImageRef>; N],
    ) -> [Option<ImageRef>; N] {
        std::array::from_fn(|index| user[index].clone().or_else(|| baseline[index].clone()))
    }

    Outfit {
        outer: merge(&user.outer, &baseline.outer),
        inner: merge(&user.inner, &baseline.inner),
        bottoms: merge(&user.bottoms, &baseline.bottoms),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub status: Status,
    pub base_image: Option<ImageRef>,
    /// Detections captured at analysis time. Never touched by user edits.
    pub baseline_outfit: Outfit,
    pub user_slots: Outfit,
    pub composed_image: Option<ImageRef>,
    pub prompt: String,
    pub error_message: Option<String>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn effective_outfit(&self) -> Outfit {
        effective_outfit(&self.user_slots, &self.baseline_outfit)
    }

    /// Installs a new base photo. Baseline, user slots and composite are
    /// reset in the same step so no stale detection survives.
    pub fn replace_base_image(&mut self, image: ImageRef) {
        self.base_image = Some(image);
        self.baseline_outfit = Outfit::default();
        self.user_slots = Outfit::default();
        self.composed_image = None;
        self.error_message = None;
    }

    /// Drops everything, including the prompt, and returns to `Empty`.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Composite to display: only meaningful once the status is `Done`.
    pub fn visible_composite(&self) -> Option<&ImageRef> {
        if self.status == Status::Done {
            self.composed_image.as_ref()
        } else {
            None
        }
    }

    /// Every image reference held by the state, for handle bookkeeping.
    pub fn image_refs(&self) -> Vec<&ImageRef> {
        let mut refs: Vec<&ImageRef> = Vec::new();
        refs.extend(self.base_image.as_ref());
        refs.extend(self.composed_image.as_ref());
        refs.extend(self.baseline_outfit.positions().filter_map(|(_, image)| image));
        refs.extend(self.user_slots.positions().filter_map(|(_, image)| image));
        refs
    }
}
