//! Prefix-fetch-and-slice pagination.
//!
//! The store offers "top N of a filtered, ordered query" and a separate
//! count, but no offset. Page `k` of size `s` is served by fetching the
//! first `(k + 1) * s` documents and slicing off the last page, so the
//! cost of page `k` grows linearly with `k`. That is acceptable for the
//! bounded collections the tracker pages over (low thousands of rows) and
//! buys jumping straight to any page without keeping cursors.
//!
//! Filters whose value is missing, null or an empty string are dropped
//! before querying. Rejections from the store (for instance an inequality
//! filter on a different field than the sort) are returned unchanged.

use tracing::debug;

use crate::config::PaginationConfig;
use crate::error::{Error, Result};
use crate::model::{Principal, UserId};
use crate::store::query::normalize_filters;
use crate::store::{Collection, Document, DocumentStore, Filter, FilterOp, OrderBy, Query, Record};

/// Appended to a search term to close its prefix range. It sorts after
/// every character a title is expected to hold.
const PREFIX_END: char = '\u{f8ff}';

/// Which page to fetch and how.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    /// 0-based.
    pub page_index: usize,
    pub page_size: usize,
    pub filters: Vec<Filter>,
    pub order_by: OrderBy,
}

impl PageRequest {
    /// Page `page_index` of `page_size`, newest first, unfiltered.
    #[must_use]
    pub fn new(page_index: usize, page_size: usize) -> Self {
        Self {
            page_index,
            page_size,
            filters: Vec::new(),
            order_by: OrderBy::default(),
        }
    }

    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    pub fn filters(mut self, filters: impl IntoIterator<Item = Filter>) -> Self {
        self.filters.extend(filters);
        self
    }

    #[must_use]
    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by = order;
        self
    }

    /// Number of documents requested from the store for this page.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for a zero page size or when the
    /// prefix length overflows.
    pub fn prefix_len(&self) -> Result<usize> {
        if self.page_size == 0 {
            return Err(Error::InvalidRequest("page size must be at least 1".into()));
        }
        self.page_index
            .checked_add(1)
            .and_then(|pages| pages.checked_mul(self.page_size))
            .ok_or_else(|| {
                Error::InvalidRequest(format!(
                    "page {} of size {} is out of range",
                    self.page_index, self.page_size
                ))
            })
    }
}

/// One page of results plus the total number of matching documents.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// From the store's count, not from `items`.
    pub total_count: u64,
    pub page_index: usize,
    pub page_size: usize,
}

impl<T> Page<T> {
    /// Pages needed to show `total_count` items. Zero when nothing matches.
    #[must_use]
    pub fn page_count(&self) -> u64 {
        page_count(self.total_count, self.page_size)
    }

    #[must_use]
    pub fn has_next(&self) -> bool {
        (self.page_index as u64).saturating_add(1) < self.page_count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Convert every item, keeping the page metadata.
    ///
    /// # Errors
    ///
    /// Returns the first conversion error.
    pub fn try_map<U, E>(self, f: impl FnMut(T) -> Result<U, E>) -> Result<Page<U>, E> {
        Ok(Page {
            items: self.items.into_iter().map(f).collect::<Result<_, E>>()?,
            total_count: self.total_count,
            page_index: self.page_index,
            page_size: self.page_size,
        })
    }
}

/// `ceil(total / page_size)`; zero for a zero page size.
#[must_use]
pub fn page_count(total: u64, page_size: usize) -> u64 {
    if page_size == 0 {
        return 0;
    }
    total.div_ceil(page_size as u64)
}

/// Cut page `page_index` out of a fetched prefix.
///
/// Page 0 is the prefix itself. A prefix shorter than
/// `page_index * page_size` (the data shrank, or the page lies past the
/// end) yields an empty page.
#[must_use]
pub fn slice_prefix<T>(mut prefix: Vec<T>, page_index: usize, page_size: usize) -> Vec<T> {
    if page_index == 0 {
        return prefix;
    }
    let Some(start) = page_index.checked_mul(page_size) else {
        return Vec::new();
    };
    if prefix.len() <= start {
        return Vec::new();
    }
    let end = start.saturating_add(page_size).min(prefix.len());
    prefix.truncate(end);
    prefix.split_off(start)
}

/// Fetch one page of raw documents from `collection`.
///
/// The count is requested first, with the same normalized filters, then
/// the prefix.
///
/// # Errors
///
/// Returns [`Error::InvalidRequest`] for an unusable page request, and
/// [`Error::Store`] with the store's own error for rejected queries.
pub fn fetch_page(
    store: &dyn DocumentStore,
    collection: Collection,
    request: &PageRequest,
) -> Result<Page<Document>> {
    let limit = request.prefix_len()?;
    let filters = normalize_filters(&request.filters);

    let total_count = store.count(collection, &filters)?;
    let query = Query::new(collection)
        .filters(filters)
        .order_by(request.order_by.clone())
        .limit(limit);
    let prefix = store.query(&query)?;
    let fetched = prefix.len();
    let items = slice_prefix(prefix, request.page_index, request.page_size);

    debug!(
        %collection,
        page = request.page_index,
        size = request.page_size,
        limit,
        fetched,
        returned = items.len(),
        total_count,
        "page fetched"
    );

    Ok(Page {
        items,
        total_count,
        page_index: request.page_index,
        page_size: request.page_size,
    })
}

/// Typed variant of [`fetch_page`] over the record's own collection.
///
/// # Errors
///
/// As [`fetch_page`], plus [`Error::Codec`] when a returned document does
/// not decode.
pub fn fetch_records<R: Record>(store: &dyn DocumentStore, request: &PageRequest) -> Result<Page<R>> {
    fetch_page(store, R::COLLECTION, request)?.try_map(|doc| {
        doc.decode::<R>()
            .map_err(|err| Error::codec(format!("{}/{}", R::COLLECTION, doc.id), err))
    })
}

/// Page/limit state of a paged table view.
///
/// `page` is 0-based internally and 1-based in query parameters. Changing
/// the page size jumps back to the first page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageState {
    page: usize,
    limit: usize,
    max_limit: usize,
}

impl PageState {
    #[must_use]
    pub fn new(config: &PaginationConfig) -> Self {
        let max_limit = config.max_page_size.max(1);
        Self {
            page: 0,
            limit: config.default_page_size.clamp(1, max_limit),
            max_limit,
        }
    }

    /// Restore from `page` / `limit` query parameters. Missing or
    /// unparseable values fall back to the first page and the configured
    /// default size.
    pub fn from_query<'a, I>(params: I, config: &PaginationConfig) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut state = Self::new(config);
        let mut page_param = None;
        for (key, value) in params {
            match key {
                "page" => page_param = value.trim().parse::<usize>().ok(),
                "limit" => {
                    if let Some(limit) = value.trim().parse::<usize>().ok().filter(|l| *l > 0) {
                        state.limit = limit.min(state.max_limit);
                    }
                }
                _ => {}
            }
        }
        state.page = page_param.map_or(0, |page| page.saturating_sub(1));
        state
    }

    /// `page` (1-based) and `limit`, ready to write back to the URL.
    #[must_use]
    pub fn to_query(&self) -> [(&'static str, String); 2] {
        [
            ("page", self.page.saturating_add(1).to_string()),
            ("limit", self.limit.to_string()),
        ]
    }

    #[must_use]
    pub const fn page(&self) -> usize {
        self.page
    }

    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    pub fn set_page(&mut self, page: usize) {
        self.page = page;
    }

    /// Change the page size (clamped to `1..=max_page_size`) and return to
    /// the first page.
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit.clamp(1, self.max_limit);
        self.page = 0;
    }

    #[must_use]
    pub fn page_count(&self, total: u64) -> u64 {
        page_count(total, self.limit)
    }

    /// A request for the current page with the given filters and order.
    #[must_use]
    pub fn request(&self, filters: Vec<Filter>, order_by: OrderBy) -> PageRequest {
        PageRequest {
            page_index: self.page,
            page_size: self.limit,
            filters,
            order_by,
        }
    }
}

/// Search box and assignee picker of the paged ticket table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TicketListFilter {
    /// Title prefix. Empty means no search.
    pub search: String,
    /// Assignee chosen by an admin. Ignored for everyone else.
    pub assignee: Option<UserId>,
}

impl TicketListFilter {
    /// Filters and sort for the ticket table.
    ///
    /// A search becomes the range `title >= term AND title <= term + U+F8FF`
    /// sorted by `title asc`, since the store needs the sort on the
    /// inequality field. Without a search the table is newest first.
    /// Admins may narrow to one assignee; everyone else only ever lists
    /// their own tickets.
    #[must_use]
    pub fn constraints(&self, principal: &Principal) -> (Vec<Filter>, OrderBy) {
        let mut filters = Vec::new();
        let order = if self.search.is_empty() {
            OrderBy::desc("createdAt")
        } else {
            filters.push(Filter::new("title", FilterOp::Gte, self.search.as_str()));
            filters.push(Filter::new(
                "title",
                FilterOp::Lte,
                format!("{}{PREFIX_END}", self.search),
            ));
            OrderBy::asc("title")
        };
        let assignee = if principal.is_admin() {
            self.assignee.as_ref()
        } else {
            Some(&principal.id)
        };
        if let Some(assignee) = assignee {
            filters.push(Filter::eq("assigneeId", assignee.as_str()));
        }
        (filters, order)
    }

    /// The request for the table's current page.
    #[must_use]
    pub fn request(&self, principal: &Principal, state: &PageState) -> PageRequest {
        let (filters, order) = self.constraints(principal);
        state.request(filters, order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GroupAssignments, Role};
    use crate::store::memory::ReadCall;
    use crate::store::{Fields, MemoryStore, StoreError};
    use serde_json::{Value, json};

    fn fields(value: Value) -> Fields {
        let Value::Object(map) = value else {
            panic!("fields must be an object");
        };
        map
    }

    fn seeded(n: i64) -> MemoryStore {
        let store = MemoryStore::new();
        for i in 0..n {
            let status = if i % 2 == 0 { "todo" } else { "fixed" };
            store
                .set(
                    Collection::Tickets,
                    &format!("t{i:02}"),
                    fields(json!({"createdAt": i, "status": status, "title": format!("T{i}")})),
                    false,
                )
                .unwrap();
        }
        store
    }

    fn ids(page: &Page<Document>) -> Vec<String> {
        page.items.iter().map(|d| d.id.clone()).collect()
    }

    #[test]
    fn third_page_fetches_thirty_and_returns_the_tail() {
        let store = seeded(25);
        let request = PageRequest::new(2, 10).order_by(OrderBy::asc("createdAt"));
        let page = fetch_page(&store, Collection::Tickets, &request).unwrap();
        assert_eq!(ids(&page), vec!["t20", "t21", "t22", "t23", "t24"]);
        assert_eq!(page.total_count, 25);
        assert_eq!(page.page_count(), 3);
        assert!(!page.has_next());

        let reads = store.reads();
        assert!(matches!(reads[0], ReadCall::Count { .. }));
        let ReadCall::Query(query) = &reads[1] else {
            panic!("expected a query after the count");
        };
        assert_eq!(query.limit, Some(30));
    }

    #[test]
    fn first_page_is_the_prefix_itself() {
        let store = seeded(25);
        let request = PageRequest::new(0, 10);
        let page = fetch_page(&store, Collection::Tickets, &request).unwrap();
        let direct = store
            .query(&Query::new(Collection::Tickets).order_by(OrderBy::default()).limit(10))
            .unwrap();
        assert_eq!(page.items, direct);
        assert!(page.has_next());
    }

    #[test]
    fn page_past_the_end_is_empty() {
        let store = seeded(5);
        let page = fetch_page(&store, Collection::Tickets, &PageRequest::new(3, 5)).unwrap();
        assert!(page.is_empty());
        assert_eq!(page.total_count, 5);
    }

    #[test]
    fn blank_filters_are_not_constraints() {
        let store = seeded(6);
        let request = PageRequest::new(0, 10)
            .filter(Filter::eq("status", ""))
            .filter(Filter::unset("assigneeId", FilterOp::Eq))
            .filter(Filter::new("title", FilterOp::Eq, Value::Null));
        let page = fetch_page(&store, Collection::Tickets, &request).unwrap();
        assert_eq!(page.items.len(), 6);
        assert_eq!(page.total_count, 6);
    }

    #[test]
    fn count_uses_the_same_filters() {
        let store = seeded(7);
        let request = PageRequest::new(1, 2).filter(Filter::eq("status", "todo"));
        let page = fetch_page(&store, Collection::Tickets, &request).unwrap();
        assert_eq!(page.total_count, 4);
        assert_eq!(page.items.len(), 2);
    }

    #[test]
    fn zero_page_size_never_reaches_the_store() {
        let store = seeded(3);
        let err = fetch_page(&store, Collection::Tickets, &PageRequest::new(0, 0)).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        let err =
            fetch_page(&store, Collection::Tickets, &PageRequest::new(usize::MAX, 2)).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert!(store.reads().is_empty());
    }

    #[test]
    fn incompatible_sort_is_rejected_verbatim() {
        let store = seeded(3);
        let request = PageRequest::new(0, 10)
            .filter(Filter::new("status", FilterOp::NotEq, "deleted"))
            .order_by(OrderBy::desc("createdAt"));
        let err = fetch_page(&store, Collection::Tickets, &request).unwrap_err();
        let Error::Store(StoreError::Rejected(message)) = err else {
            panic!("expected the store's rejection");
        };
        assert!(message.contains("orderBy"));
    }

    #[test]
    fn typed_pages_decode_records() {
        let store = seeded(3);
        let page: Page<crate::model::Ticket> =
            fetch_records(&store, &PageRequest::new(0, 2)).unwrap();
        let titles: Vec<&str> = page.items.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["T2", "T1"]);
    }

    #[test]
    fn slicing_handles_short_prefixes() {
        assert_eq!(slice_prefix(vec![1, 2, 3], 0, 2), vec![1, 2, 3]);
        assert_eq!(slice_prefix(vec![1, 2, 3], 1, 2), vec![3]);
        assert!(slice_prefix(vec![1, 2], 1, 2).is_empty());
        assert!(slice_prefix(vec![1], 5, 2).is_empty());
    }

    #[test]
    fn page_state_round_trips_one_based_params() {
        let config = PaginationConfig::default();
        let state = PageState::from_query([("page", "3"), ("limit", "25")], &config);
        assert_eq!(state.page(), 2);
        assert_eq!(state.limit(), 25);
        assert_eq!(
            state.to_query(),
            [("page", "3".to_string()), ("limit", "25".to_string())]
        );

        let fallback = PageState::from_query([("page", "zero"), ("limit", "0")], &config);
        assert_eq!(fallback.page(), 0);
        assert_eq!(fallback.limit(), config.default_page_size);
    }

    #[test]
    fn changing_limit_resets_to_first_page() {
        let mut state = PageState::new(&PaginationConfig::default());
        state.set_page(4);
        state.set_limit(1_000);
        assert_eq!(state.page(), 0);
        assert_eq!(state.limit(), 100);
        assert_eq!(state.page_count(250), 3);
        assert_eq!(state.request(Vec::new(), OrderBy::default()).page_size, 100);
    }

    #[test]
    fn page_param_saturates_at_the_last_page() {
        let mut state = PageState::new(&PaginationConfig::default());
        state.set_page(usize::MAX);
        let [(_, page), _] = state.to_query();
        assert_eq!(page, usize::MAX.to_string());
    }

    fn member(id: &str, role: Role) -> Principal {
        Principal {
            id: UserId::new(id),
            email: format!("{id}@x.com"),
            name: None,
            role: Some(role),
            group_assignments: GroupAssignments::new(),
        }
    }

    fn titled_store() -> MemoryStore {
        let store = MemoryStore::new();
        let rows = [
            ("t1", "Login broken", "u1", 1),
            ("t2", "Logo too small", "u2", 2),
            ("t3", "Logout hangs", "u1", 3),
            ("t4", "Payroll export", "u1", 4),
            ("t5", "Lo", "u2", 5),
        ];
        for (id, title, assignee, at) in rows {
            store
                .set(
                    Collection::Tickets,
                    id,
                    fields(json!({"title": title, "assigneeId": assignee, "createdAt": at})),
                    false,
                )
                .unwrap();
        }
        store
    }

    #[test]
    fn title_search_is_a_valid_prefix_range() {
        let admin = member("a", Role::Admin);
        let search = TicketListFilter {
            search: "Log".into(),
            assignee: None,
        };
        let (filters, order) = search.constraints(&admin);
        assert_eq!(order, OrderBy::asc("title"));
        assert_eq!(filters.len(), 2);
        let query = Query::new(Collection::Tickets)
            .filters(filters)
            .order_by(order)
            .limit(10);
        assert!(crate::store::query::validate(&query).is_ok());

        let store = titled_store();
        let state = PageState::new(&PaginationConfig::default());
        let page = fetch_page(&store, Collection::Tickets, &search.request(&admin, &state)).unwrap();
        assert_eq!(ids(&page), vec!["t1", "t2", "t3"]);
        assert_eq!(page.total_count, 3);
    }

    #[test]
    fn members_only_list_their_own_tickets() {
        let store = titled_store();
        let state = PageState::new(&PaginationConfig::default());
        let someone_else = TicketListFilter {
            search: String::new(),
            assignee: Some(UserId::new("u2")),
        };

        let user = member("u1", Role::User);
        let (_, order) = someone_else.constraints(&user);
        assert_eq!(order, OrderBy::desc("createdAt"));
        let page =
            fetch_page(&store, Collection::Tickets, &someone_else.request(&user, &state)).unwrap();
        assert_eq!(ids(&page), vec!["t4", "t3", "t1"]);

        let admin = member("a", Role::Admin);
        let page =
            fetch_page(&store, Collection::Tickets, &someone_else.request(&admin, &state)).unwrap();
        assert_eq!(ids(&page), vec!["t5", "t2"]);
        let everyone = TicketListFilter::default();
        let page =
            fetch_page(&store, Collection::Tickets, &everyone.request(&admin, &state)).unwrap();
        assert_eq!(page.total_count, 5);
    }

    #[test]
    fn search_and_assignee_combine() {
        let store = titled_store();
        let state = PageState::new(&PaginationConfig::default());
        let search = TicketListFilter {
            search: "Lo".into(),
            assignee: None,
        };
        let user = member("u2", Role::User);
        let page = fetch_page(&store, Collection::Tickets, &search.request(&user, &state)).unwrap();
        assert_eq!(ids(&page), vec!["t5", "t2"]);
    }
}
