//! Auto-approval policy.
//!
//! Tools are grouped into categories. A configured permission group (for
//! example `edits = ["Edit", "Write"]`) shares one approval flag; every other
//! tool is a category of its own, named after the tool. The policy lives exactly
//! as long as one agent connection and starts with every category unapproved.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

/// A tool category that carries one auto-approval flag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ToolCategory(String);

impl ToolCategory {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Maps tool names to their categories.
#[derive(Debug, Clone, Default)]
pub struct ToolCategories {
    by_tool: HashMap<String, ToolCategory>,
    groups: HashSet<ToolCategory>,
}

impl ToolCategories {
    /// Builds the mapping from configured groups (`group name -> tool names`).
    ///
    /// A tool listed in several groups belongs to the first group in name order.
    pub fn from_groups(groups: &BTreeMap<String, Vec<String>>) -> Self {
        let mut categories = Self::default();
        for (group, tools) in groups {
            let category = ToolCategory::new(group.clone());
            categories.groups.insert(category.clone());
            for tool in tools {
                categories
                    .by_tool
                    .entry(tool.clone())
                    .or_insert_with(|| category.clone());
            }
        }
        categories
    }

    /// Returns the category of `tool_name`.
    pub fn category_of(&self, tool_name: &str) -> ToolCategory {
        self.by_tool
            .get(tool_name)
            .cloned()
            .unwrap_or_else(|| ToolCategory::new(tool_name))
    }

    /// Returns true if `tool_name` belongs to a configured group.
    pub fn is_grouped(&self, tool_name: &str) -> bool {
        self.by_tool.contains_key(tool_name)
    }

    /// Returns the configured group named `name`, if any.
    pub fn group(&self, name: &str) -> Option<ToolCategory> {
        self.groups.iter().find(|c| c.as_str() == name).cloned()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AutoApprovalPolicy {
    approved: HashSet<ToolCategory>,
}

impl AutoApprovalPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn toggle(&mut self, category: &ToolCategory, on: bool) {
        if on {
            self.approved.insert(category.clone());
        } else {
            self.approved.remove(category);
        }
    }

    pub fn is_approved(&self, category: &ToolCategory) -> bool {
        self.approved.contains(category)
    }

    /// Approved categories, sorted.
    pub fn approved(&self) -> Vec<ToolCategory> {
        let mut approved: Vec<ToolCategory> = self.approved.iter().cloned().collect();
        approved.sort();
        approved
    }
}
