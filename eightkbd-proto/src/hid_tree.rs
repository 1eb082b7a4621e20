//! HID report-descriptor item-tree decoder (C3).
//!
//! Walks the short/long item stream of a HID report descriptor, tracking the
//! Global/Local state machine and the Collection nesting stack, and builds a
//! tree of [`Node`]s rooted at a synthetic id-0 collection.

use crate::error::{Error, Result};
use bitflags::bitflags;

bitflags! {
    /// Flags attached to every Input/Output/Feature main item.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ItemFlags: u32 {
        const CONSTANT           = 0x01;
        const VARIABLE           = 0x02;
        const RELATIVE           = 0x04;
        const WRAP               = 0x08;
        const NON_LINEAR         = 0x10;
        const NO_PREFERRED_STATE = 0x20;
        const NULL_STATE         = 0x40;
        const VOLATILE           = 0x80;
        const BUFFERED_BYTES     = 0x100;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    In,
    Out,
}

/// Either an explicit list of 32-bit usage values or a half-open range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Usage {
    List(Vec<u32>),
    Range(u32, u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportItem {
    pub direction: Direction,
    pub report_id: u8,
    pub flags: ItemFlags,
    pub usage: Usage,
    pub bit_size: u32,
    pub count: u32,
}

impl ReportItem {
    pub fn is_constant(&self) -> bool {
        self.flags.contains(ItemFlags::CONSTANT)
    }

    pub fn total_bits(&self) -> u64 {
        self.bit_size as u64 * self.count as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    Physical,
    Application,
    Logical,
    Report,
    NamedArray,
    UsageSwitch,
    UsageModifier,
    Vendor(u8),
}

impl CollectionKind {
    fn from_raw(value: u32) -> Self {
        if value >= 0x80 {
            return CollectionKind::Vendor(value as u8);
        }
        match value {
            0x00 => CollectionKind::Physical,
            0x01 => CollectionKind::Application,
            0x02 => CollectionKind::Logical,
            0x03 => CollectionKind::Report,
            0x04 => CollectionKind::NamedArray,
            0x05 => CollectionKind::UsageSwitch,
            0x06 => CollectionKind::UsageModifier,
            other => CollectionKind::Vendor(other as u8),
        }
    }
}

/// A node in the decoded report tree: either a nested collection or a leaf
/// report item. Iteration visits both through a single accept contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Collection(Collection),
    Item(ReportItem),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    pub id: u32,
    pub kind: CollectionKind,
    pub usage: u32,
    pub children: Vec<Node>,
}

impl Collection {
    fn root() -> Self {
        Collection {
            id: 0,
            kind: CollectionKind::Application,
            usage: 0,
            children: Vec::new(),
        }
    }

    /// Build a sub-tree shaped like `self` but containing only non-constant
    /// items matching `report_id`/`direction`, duplicating only the
    /// collection path needed to reach each surviving item.
    fn filter(&self, report_id: u8, direction: Direction) -> Option<Collection> {
        let mut children = Vec::new();
        for child in &self.children {
            match child {
                Node::Item(item) => {
                    if item.report_id == report_id
                        && item.direction == direction
                        && !item.is_constant()
                    {
                        children.push(Node::Item(item.clone()));
                    }
                }
                Node::Collection(sub) => {
                    if let Some(filtered) = sub.filter(report_id, direction) {
                        children.push(Node::Collection(filtered));
                    }
                }
            }
        }
        if children.is_empty() {
            None
        } else {
            Some(Collection {
                id: self.id,
                kind: self.kind,
                usage: self.usage,
                children,
            })
        }
    }

    /// Sum of `bit_size * count` across every descendant non-collection item.
    pub fn total_bits(&self) -> u64 {
        self.children
            .iter()
            .map(|child| match child {
                Node::Item(item) => item.total_bits(),
                Node::Collection(sub) => sub.total_bits(),
            })
            .sum()
    }

    /// Every report-id that appears anywhere under this tree, in the given direction.
    fn report_ids(&self, direction: Direction, out: &mut Vec<u8>) {
        for child in &self.children {
            match child {
                Node::Item(item) => {
                    if item.direction == direction && !out.contains(&item.report_id) {
                        out.push(item.report_id);
                    }
                }
                Node::Collection(sub) => sub.report_ids(direction, out),
            }
        }
    }
}

/// The decoded report-descriptor tree plus the `get_reports` index over it.
#[derive(Debug, Clone)]
pub struct ReportTree {
    pub root: Collection,
}

impl ReportTree {
    /// Map of `report_id -> Collection` restricted to non-constant items for
    /// that report id and direction. Mirrors the structure of the full tree,
    /// duplicating only the path to reach each surviving item.
    pub fn get_reports(&self, direction: Direction) -> std::collections::BTreeMap<u8, Collection> {
        let mut ids = Vec::new();
        self.root.report_ids(direction, &mut ids);
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| self.root.filter(id, direction).map(|c| (id, c)))
            .collect()
    }
}

const ITEM_SIZE_MASK: u8 = 0x03;
const ITEM_TYPE_MASK: u8 = 0x0C;
const ITEM_TAG_MASK: u8 = 0xF0;

const ITEM_TYPE_MAIN: u8 = 0x00;
const ITEM_TYPE_GLOBAL: u8 = 0x04;
const ITEM_TYPE_LOCAL: u8 = 0x08;
const ITEM_TYPE_RESERVED: u8 = 0x0C;

const ITEM_MAIN_INPUT: u8 = 0x80;
const ITEM_MAIN_OUTPUT: u8 = 0x90;
const ITEM_MAIN_FEATURE: u8 = 0xB0;
const ITEM_MAIN_COLLECTION: u8 = 0xA0;
const ITEM_MAIN_END_COLLECTION: u8 = 0xC0;

const ITEM_GLOBAL_USAGE_PAGE: u8 = 0x00;
const ITEM_GLOBAL_LOGICAL_MINIMUM: u8 = 0x10;
const ITEM_GLOBAL_LOGICAL_MAXIMUM: u8 = 0x20;
const ITEM_GLOBAL_PHYSICAL_MINIMUM: u8 = 0x30;
const ITEM_GLOBAL_PHYSICAL_MAXIMUM: u8 = 0x40;
const ITEM_GLOBAL_UNIT_EXPONENT: u8 = 0x50;
const ITEM_GLOBAL_UNIT: u8 = 0x60;
const ITEM_GLOBAL_REPORT_SIZE: u8 = 0x70;
const ITEM_GLOBAL_REPORT_ID: u8 = 0x80;
const ITEM_GLOBAL_REPORT_COUNT: u8 = 0x90;
const ITEM_GLOBAL_PUSH: u8 = 0xA0;
const ITEM_GLOBAL_POP: u8 = 0xB0;

const ITEM_LOCAL_USAGE: u8 = 0x00;
const ITEM_LOCAL_USAGE_MINIMUM: u8 = 0x10;
const ITEM_LOCAL_USAGE_MAXIMUM: u8 = 0x20;

const ITEM_LONG_BYTE: u8 = 0xF7;

#[derive(Debug, Clone, Default)]
struct GlobalState {
    usage_page: u32,
    logical_minimum: i32,
    logical_maximum: i32,
    physical_minimum: i32,
    physical_maximum: i32,
    unit_exponent: i32,
    unit: i32,
    report_size: u32,
    report_id: u8,
    report_count: u32,
}

#[derive(Debug, Clone, Default)]
struct LocalState {
    usage_list: Vec<u32>,
    usage_minimum: u32,
    usage_maximum: u32,
}

impl LocalState {
    fn clear(&mut self) {
        *self = LocalState::default();
    }

    fn usage(&self) -> Usage {
        if self.usage_list.is_empty() {
            Usage::Range(self.usage_minimum, self.usage_maximum)
        } else {
            Usage::List(self.usage_list.clone())
        }
    }
}

fn item_data_uint(bytes: &[u8]) -> u32 {
    let mut value = 0u32;
    for (i, b) in bytes.iter().enumerate() {
        value |= (*b as u32) << (8 * i);
    }
    value
}

fn item_data_sint(bytes: &[u8]) -> i32 {
    let value = item_data_uint(bytes);
    match bytes.len() {
        1 => (value as i8) as i32,
        2 => (value as i16) as i32,
        4 => value as i32,
        0 => 0,
        _ => value as i32,
    }
}

/// Parse a HID report descriptor byte stream into a tree rooted at a
/// synthetic id-0 collection.
pub fn decode_report_descriptor(data: &[u8]) -> Result<Collection> {
    let mut global = GlobalState::default();
    let mut local = LocalState::default();
    let mut stack: Vec<GlobalState> = Vec::new();
    let mut current_usage: u32 = 0;

    let mut collections: Vec<Collection> = vec![Collection::root()];
    let mut next_collection_id: u32 = 1;

    let mut pos = 0usize;
    while pos < data.len() {
        if data[pos] == ITEM_LONG_BYTE {
            if pos + 2 >= data.len() {
                return Err(Error::MalformedDescriptor(
                    "truncated long item".to_string(),
                ));
            }
            let size = data[pos + 1] as usize;
            pos += size + 3;
            continue;
        }

        let prefix = data[pos];
        let size = match prefix & ITEM_SIZE_MASK {
            0 => 0,
            1 => 1,
            2 => 2,
            3 => 4,
            _ => unreachable!(),
        };
        if pos + 1 + size > data.len() {
            return Err(Error::MalformedDescriptor(format!(
                "item at offset {pos} runs past end of descriptor"
            )));
        }
        let item_data = &data[pos + 1..pos + 1 + size];

        match prefix & ITEM_TYPE_MASK {
            ITEM_TYPE_MAIN => match prefix & ITEM_TAG_MASK {
                ITEM_MAIN_INPUT | ITEM_MAIN_OUTPUT => {
                    let direction = if prefix & ITEM_TAG_MASK == ITEM_MAIN_INPUT {
                        Direction::In
                    } else {
                        Direction::Out
                    };
                    let flags = ItemFlags::from_bits_truncate(item_data_uint(item_data));
                    let item = ReportItem {
                        direction,
                        report_id: global.report_id,
                        flags,
                        usage: local.usage(),
                        bit_size: global.report_size,
                        count: global.report_count,
                    };
                    collections
                        .last_mut()
                        .expect("root collection always present")
                        .children
                        .push(Node::Item(item));
                    local.clear();
                }
                ITEM_MAIN_FEATURE => {
                    // Feature reports are not driven by this device; record
                    // nothing but still clear locals per the Main-item rule.
                    local.clear();
                }
                ITEM_MAIN_COLLECTION => {
                    let kind = CollectionKind::from_raw(item_data_uint(item_data));
                    let collection = Collection {
                        id: next_collection_id,
                        kind,
                        usage: current_usage,
                        children: Vec::new(),
                    };
                    next_collection_id += 1;
                    collections.push(collection);
                    local.clear();
                }
                ITEM_MAIN_END_COLLECTION => {
                    let finished = collections.pop().ok_or_else(|| {
                        Error::MalformedDescriptor("End-Collection with no open collection".into())
                    })?;
                    collections
                        .last_mut()
                        .ok_or_else(|| {
                            Error::MalformedDescriptor(
                                "End-Collection closed the synthetic root".into(),
                            )
                        })?
                        .children
                        .push(Node::Collection(finished));
                    local.clear();
                }
                _ => local.clear(),
            },
            ITEM_TYPE_GLOBAL => match prefix & ITEM_TAG_MASK {
                ITEM_GLOBAL_USAGE_PAGE => {
                    global.usage_page = item_data_uint(item_data) << 16;
                    current_usage = global.usage_page;
                }
                ITEM_GLOBAL_LOGICAL_MINIMUM => global.logical_minimum = item_data_sint(item_data),
                ITEM_GLOBAL_LOGICAL_MAXIMUM => global.logical_maximum = item_data_sint(item_data),
                ITEM_GLOBAL_PHYSICAL_MINIMUM => {
                    global.physical_minimum = item_data_sint(item_data)
                }
                ITEM_GLOBAL_PHYSICAL_MAXIMUM => {
                    global.physical_maximum = item_data_sint(item_data)
                }
                ITEM_GLOBAL_UNIT_EXPONENT => global.unit_exponent = item_data_sint(item_data),
                ITEM_GLOBAL_UNIT => global.unit = item_data_sint(item_data),
                ITEM_GLOBAL_REPORT_SIZE => global.report_size = item_data_uint(item_data),
                ITEM_GLOBAL_REPORT_ID => global.report_id = item_data_uint(item_data) as u8,
                ITEM_GLOBAL_REPORT_COUNT => global.report_count = item_data_uint(item_data),
                ITEM_GLOBAL_PUSH => stack.push(global.clone()),
                ITEM_GLOBAL_POP => {
                    global = stack.pop().ok_or_else(|| {
                        Error::MalformedDescriptor("Pop with empty Global stack".into())
                    })?;
                }
                _ => {}
            },
            ITEM_TYPE_LOCAL => match prefix & ITEM_TAG_MASK {
                ITEM_LOCAL_USAGE => {
                    let mut usage = item_data_uint(item_data);
                    if usage <= 0xFFFF {
                        usage |= global.usage_page;
                    }
                    current_usage = usage;
                    local.usage_list.push(usage);
                }
                ITEM_LOCAL_USAGE_MINIMUM => local.usage_minimum = item_data_uint(item_data),
                ITEM_LOCAL_USAGE_MAXIMUM => local.usage_maximum = item_data_uint(item_data),
                _ => {}
            },
            ITEM_TYPE_RESERVED => {}
            _ => unreachable!(),
        }

        pos += size + 1;
    }

    if collections.len() != 1 {
        return Err(Error::MalformedDescriptor(
            "unterminated Collection at end of descriptor".to_string(),
        ));
    }

    Ok(collections.pop().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal one-byte keyboard-style report: Usage Page (Keyboard),
    /// Report Size 8, Report Count 1, Input (Data,Var,Abs), wrapped in an
    /// Application collection.
    fn simple_descriptor() -> Vec<u8> {
        vec![
            0x05, 0x07, // Usage Page (Keyboard)
            0xA1, 0x01, // Collection (Application)
            0x85, 0x01, //   Report ID (1)
            0x75, 0x08, //   Report Size (8)
            0x95, 0x01, //   Report Count (1)
            0x19, 0x00, //   Usage Minimum (0)
            0x29, 0xFF, //   Usage Maximum (255)
            0x81, 0x00, //   Input (Data,Array,Abs)
            0xC0, // End Collection
        ]
    }

    #[test]
    fn decodes_single_input_item() {
        let root = decode_report_descriptor(&simple_descriptor()).unwrap();
        assert_eq!(root.id, 0);
        assert_eq!(root.children.len(), 1);
        let Node::Collection(app) = &root.children[0] else {
            panic!("expected a collection");
        };
        assert_eq!(app.kind, CollectionKind::Application);
        assert_eq!(app.id, 1);
        assert_eq!(app.children.len(), 1);
        let Node::Item(item) = &app.children[0] else {
            panic!("expected an item");
        };
        assert_eq!(item.report_id, 1);
        assert_eq!(item.bit_size, 8);
        assert_eq!(item.count, 1);
        assert_eq!(item.usage, Usage::Range(0, 0xFF));
        assert!(!item.is_constant());
    }

    #[test]
    fn push_pop_restores_global_state() {
        let desc = vec![
            0x75, 0x08, // Report Size 8
            0xA4, // Push
            0x75, 0x01, // Report Size 1 (inside push)
            0xB4, // Pop
            0xA1, 0x01, // Collection (Application)
            0x95, 0x01, // Report Count 1
            0x81, 0x01, // Input (Constant)
            0xC0,
        ];
        let root = decode_report_descriptor(&desc).unwrap();
        let Node::Collection(app) = &root.children[0] else {
            panic!("expected collection");
        };
        let Node::Item(item) = &app.children[0] else {
            panic!("expected item");
        };
        // Report Size should be restored to 8 (the pre-Push value), not 1.
        assert_eq!(item.bit_size, 8);
        assert!(item.is_constant());
    }

    #[test]
    fn local_state_resets_after_main_item() {
        let desc = vec![
            0xA1, 0x01, // Collection (Application)
            0x09, 0x01, //   Usage 1
            0x75, 0x01, 0x95, 0x01, 0x81, 0x02, //   Input (Var) consumes Usage 1
            0x75, 0x01, 0x95, 0x01, 0x81, 0x02, //   Input (Var) with no Usage: local reset
            0xC0,
        ];
        let root = decode_report_descriptor(&desc).unwrap();
        let Node::Collection(app) = &root.children[0] else {
            panic!("expected collection")
        };
        let Node::Item(first) = &app.children[0] else {
            panic!()
        };
        let Node::Item(second) = &app.children[1] else {
            panic!()
        };
        assert_eq!(first.usage, Usage::List(vec![1]));
        assert_eq!(second.usage, Usage::Range(0, 0));
    }

    #[test]
    fn get_reports_groups_by_report_id_and_direction() {
        let desc = vec![
            0xA1, 0x01, // Collection (Application)
            0x85, 0x01, //   Report ID 1
            0x75, 0x08, 0x95, 0x01, 0x81, 0x02, //   Input
            0x85, 0x02, //   Report ID 2
            0x75, 0x08, 0x95, 0x01, 0x91, 0x02, //   Output
            0xC0,
        ];
        let root = decode_report_descriptor(&desc).unwrap();
        let tree = ReportTree { root };
        let in_reports = tree.get_reports(Direction::In);
        let out_reports = tree.get_reports(Direction::Out);
        assert_eq!(in_reports.keys().copied().collect::<Vec<_>>(), vec![1]);
        assert_eq!(out_reports.keys().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn total_bits_sums_descendants() {
        let root = decode_report_descriptor(&simple_descriptor()).unwrap();
        assert_eq!(root.total_bits(), 8);
    }
}
