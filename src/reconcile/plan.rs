use std::fmt;

/// Action the reconciler decided on for one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    Create,
    UpdateImage,
    Scale,
    Remove,
    Noop,
}

impl fmt::Display for PlanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlanKind::Create => "create",
            PlanKind::UpdateImage => "update-image",
            PlanKind::Scale => "scale",
            PlanKind::Remove => "remove",
            PlanKind::Noop => "noop",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct PlanItem {
    pub kind: PlanKind,
    pub service: String,
    pub from: Option<String>,
    pub to: Option<String>,
    pub reason: String,
    /// Removals, and image updates with no overlapping replica to serve
    /// traffic during the swap, lose running state.
    pub destructive: bool,
}

/// Ordered actions that make observed state equal desired state.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    items: Vec<PlanItem>,
}

impl Plan {
    pub fn new(items: Vec<PlanItem>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[PlanItem] {
        &self.items
    }

    /// Actions that actually change remote state, in plan order.
    pub fn actionable(&self) -> impl Iterator<Item = &PlanItem> {
        self.items.iter().filter(|i| i.kind != PlanKind::Noop)
    }

    pub fn is_empty(&self) -> bool {
        self.actionable().next().is_none()
    }

    /// Destructive plans require operator confirmation.
    pub fn needs_confirmation(&self) -> bool {
        self.items.iter().any(|i| i.destructive)
    }

    pub fn format_plan(&self) -> String {
        if self.is_empty() {
            return "No changes. Observed state matches the configuration.".to_string();
        }

        let mut out = String::new();
        for item in self.actionable() {
            let change = match (&item.from, &item.to) {
                (Some(from), Some(to)) => format!(" ({} -> {})", from, to),
                (None, Some(to)) => format!(" ({})", to),
                (Some(from), None) => format!(" (currently {})", from),
                (None, None) => String::new(),
            };
            let marker = if item.destructive { "!" } else { " " };
            out.push_str(&format!(
                "{} {:<12} {}{} - {}\n",
                marker, item.kind.to_string(), item.service, change, item.reason
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(kind: PlanKind, service: &str, destructive: bool) -> PlanItem {
        PlanItem {
            kind,
            service: service.to_string(),
            from: None,
            to: None,
            reason: "test".into(),
            destructive,
        }
    }

    #[test]
    fn noop_only_plan_is_empty() {
        let plan = Plan::new(vec![item(PlanKind::Noop, "web", false)]);
        assert!(plan.is_empty());
        assert!(!plan.needs_confirmation());
        assert!(plan.format_plan().contains("No changes"));
    }

    #[test]
    fn remove_requires_confirmation() {
        let plan = Plan::new(vec![
            item(PlanKind::Create, "api", false),
            item(PlanKind::Remove, "old", true),
        ]);
        assert!(!plan.is_empty());
        assert!(plan.needs_confirmation());
    }

    #[test]
    fn format_skips_noops() {
        let plan = Plan::new(vec![
            item(PlanKind::Noop, "db", false),
            item(PlanKind::Create, "api", false),
        ]);
        let rendered = plan.format_plan();
        assert!(rendered.contains("create"));
        assert!(!rendered.contains("db"));
    }
}
