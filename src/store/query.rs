//! Issue listing pipeline: filter → sort → paginate.

use std::collections::HashSet;

use crate::models::{Direction, Issue, IssueFilters, ListResponse, SortKey};

/// Upper bound on `per_page` for every listing.
pub const MAX_PER_PAGE: usize = 100;

/// Apply `filters` to an unordered set of issues.
///
/// Filters run in a fixed order: state, labels (AND), assignee.
/// `total_count` is the number of issues that survive filtering, before
/// pagination.
pub fn apply_filters(issues: Vec<Issue>, filters: &IssueFilters) -> ListResponse<Issue> {
    let mut issues: Vec<Issue> = issues
        .into_iter()
        .filter(|issue| matches_state(issue, filters.state.as_deref()))
        .filter(|issue| matches_labels(issue, filters.labels.as_deref()))
        .filter(|issue| matches_assignee(issue, filters.assignee.as_deref()))
        .collect();

    match filters.sort {
        SortKey::Created => issues.sort_by_key(|i| i.created_at),
        SortKey::Updated => issues.sort_by_key(|i| i.updated_at),
        SortKey::Comments => issues.sort_by_key(|i| i.comments),
    }
    if filters.direction == Direction::Desc {
        issues.reverse();
    }

    paginate(issues, filters.page, filters.per_page)
}

/// Slice one page out of an already-ordered list.
pub fn paginate<T>(items: Vec<T>, page: usize, per_page: usize) -> ListResponse<T> {
    let per_page = per_page.min(MAX_PER_PAGE);
    let page = page.max(1);
    let total_count = items.len();
    let offset = (page - 1).saturating_mul(per_page);

    let items = items.into_iter().skip(offset).take(per_page).collect();

    ListResponse {
        items,
        total_count,
        page,
        per_page,
    }
}

fn matches_state(issue: &Issue, state: Option<&str>) -> bool {
    match state {
        None | Some("all") => true,
        Some(wanted) => issue.state.as_str() == wanted,
    }
}

fn matches_labels(issue: &Issue, labels: Option<&str>) -> bool {
    let Some(labels) = labels else {
        return true;
    };
    let required: HashSet<&str> = labels
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .collect();
    let present: HashSet<&str> = issue.labels.iter().map(|l| l.name.as_str()).collect();
    required.is_subset(&present)
}

fn matches_assignee(issue: &Issue, assignee: Option<&str>) -> bool {
    match assignee {
        None => true,
        Some("none") => issue.assignees.is_empty(),
        Some("*") => !issue.assignees.is_empty(),
        Some(login) => issue.assignees.iter().any(|a| a.login == login),
    }
}
