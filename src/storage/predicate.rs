//! Query-side hooks
//!
//! Expression parsing lives outside the engine; callers hand in anything
//! implementing these traits, including plain closures.

use crate::storage::types::{DataPoint, Tag};

/// Decides whether a series takes part in a query
pub trait TagFilter: Send + Sync {
    fn matches(&self, tags: &[Tag]) -> bool;

    /// Tags every matching series must carry, when known up front
    ///
    /// Lets a measurement narrow the candidate series through its tag index
    /// before `matches` runs.
    fn required_tags(&self) -> Option<&[Tag]> {
        None
    }
}

impl<F> TagFilter for F
where
    F: Fn(&[Tag]) -> bool + Send + Sync,
{
    fn matches(&self, tags: &[Tag]) -> bool {
        self(tags)
    }
}

/// Decides whether a decoded point is returned
pub trait ValuePredicate: Send + Sync {
    fn test(&self, point: &DataPoint) -> bool;
}

impl<F> ValuePredicate for F
where
    F: Fn(&DataPoint) -> bool + Send + Sync,
{
    fn test(&self, point: &DataPoint) -> bool {
        self(point)
    }
}

/// Matches series carrying every one of the given tags
#[derive(Debug, Clone, Default)]
pub struct TagEquals {
    required: Vec<Tag>,
}

impl TagEquals {
    pub fn new(required: Vec<Tag>) -> Self {
        Self { required }
    }
}

impl TagFilter for TagEquals {
    fn matches(&self, tags: &[Tag]) -> bool {
        self.required.iter().all(|t| tags.contains(t))
    }

    fn required_tags(&self) -> Option<&[Tag]> {
        (!self.required.is_empty()).then_some(self.required.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::Point;

    #[test]
    fn test_closure_filters() {
        let filter = |tags: &[Tag]| tags.iter().any(|t| t.key == "host");
        assert!(filter.matches(&[Tag::new("host", "a")]));
        assert!(!filter.matches(&[]));

        let predicate = |p: &DataPoint| p.value() > 1.5;
        assert!(predicate.test(&DataPoint::new(Point::from_f64(0, 2.0), true)));
        assert!(!predicate.test(&DataPoint::new(Point::new(0, 1), false)));
    }

    #[test]
    fn test_tag_equals() {
        let filter = TagEquals::new(vec![Tag::new("dc", "east"), Tag::new("host", "a")]);
        assert!(filter.matches(&[Tag::new("dc", "east"), Tag::new("host", "a")]));
        assert!(!filter.matches(&[Tag::new("dc", "east")]));
        assert!(TagEquals::default().matches(&[]));
        assert_eq!(filter.required_tags().map(|t| t.len()), Some(2));
        assert!(TagEquals::default().required_tags().is_none());
        assert!((|_: &[Tag]| true).required_tags().is_none());
    }
}
