//! Directory reads and writes: members, categories, locations and reviews.
//!
//! Lists are served from the query cache while fresh and written back after
//! every successful fetch. A failed list fetch still hands back the last
//! cached list, stale or not, next to the error message. Mutations
//! invalidate the list they touch and the home overview.

use std::sync::Arc;

use cherthala_core::{
    tables, Category, CherthalaError, CherthalaResult, ClientConfig, DirectoryUser,
    HomeOverview, Location, NewCategory, NewLocation, NewReview, NewUser, Review, SelectOption,
    SiteStats, TableBackend, TableQuery, UserId,
};
use cherthala_storage::QueryCache;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::auth::AuthSubscription;
use crate::batch::{batch_queries, BatchQuery, BatchReport};
use crate::fetch::{fetcher, FetchOptions, QueryHandle};
use crate::resilience::{optimized_query, with_deadline, QueryOptions, QueryOutcome};

/// Cache keys owned by the directory.
pub mod keys {
    pub const USERS: &str = "users";
    pub const CATEGORIES: &str = "categories";
    pub const LOCATIONS: &str = "locations";
    pub const REVIEWS: &str = "reviews";
    pub const HOME: &str = "home";
}

const LOCATION_COLUMNS: &str = "*, categories(category_name), users(full_name)";
const REVIEW_COLUMNS: &str = "*, locations(location_name), users(full_name)";
const RECENT_LOCATION_COLUMNS: &str = "location_id, location_name, description, address, \
     date_added, categories(category_name), users(full_name, hometown)";
const TOP_REVIEW_COLUMNS: &str = "review_id, rating, review_text, review_date, \
     locations(location_name), users(full_name, hometown)";

const RECENT_LOCATIONS: usize = 6;
const TOP_REVIEWS: usize = 4;

/// Dropdown data for the location form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationFormOptions {
    pub categories: Vec<SelectOption>,
    pub users: Vec<SelectOption>,
}

/// Dropdown data for the review form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReviewFormOptions {
    pub locations: Vec<SelectOption>,
    pub users: Vec<SelectOption>,
}

/// Directory service over a table backend.
#[derive(Clone)]
pub struct Directory {
    tables: Arc<dyn TableBackend>,
    cache: QueryCache,
    config: ClientConfig,
    auth: Option<AuthSubscription>,
}

impl Directory {
    pub fn new(tables: Arc<dyn TableBackend>, cache: QueryCache, config: ClientConfig) -> Self {
        Self {
            tables,
            cache,
            config,
            auth: None,
        }
    }

    /// Attach the signed-in user; required for adding locations and reviews.
    pub fn with_auth(mut self, auth: AuthSubscription) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    fn current_user(&self) -> CherthalaResult<UserId> {
        self.auth
            .as_ref()
            .and_then(AuthSubscription::current_user_id)
            .ok_or(CherthalaError::NotAuthenticated)
    }

    // ------------------------------------------------------------------------
    // Members
    // ------------------------------------------------------------------------

    /// Members, newest first.
    pub async fn list_users(&self) -> QueryOutcome<Vec<DirectoryUser>> {
        let query = TableQuery::from(tables::USERS).order("created_at", false);
        self.cached_list(keys::USERS, query).await
    }

    /// Add a member by hand. The id is generated locally.
    pub async fn add_user(&self, form: &NewUser) -> CherthalaResult<DirectoryUser> {
        form.validate()?;
        let row = form.to_row(Uuid::new_v4());
        let created = self.insert_one(tables::USERS, row).await?;
        self.invalidate(keys::USERS);
        Ok(created)
    }

    pub async fn delete_user(&self, id: UserId) -> CherthalaResult<u64> {
        let query = TableQuery::from(tables::USERS).eq("id", id.to_string());
        let removed = self.delete_where(query).await?;
        self.invalidate(keys::USERS);
        Ok(removed)
    }

    // ------------------------------------------------------------------------
    // Categories
    // ------------------------------------------------------------------------

    /// Categories by name.
    pub async fn list_categories(&self) -> QueryOutcome<Vec<Category>> {
        let query = TableQuery::from(tables::CATEGORIES)
            .select("category_id, category_name, description, icon_url")
            .order("category_name", true);
        self.cached_list(keys::CATEGORIES, query).await
    }

    pub async fn add_category(&self, form: &NewCategory) -> CherthalaResult<Category> {
        form.validate()?;
        let created = self.insert_one(tables::CATEGORIES, form.to_row()).await?;
        self.invalidate(keys::CATEGORIES);
        Ok(created)
    }

    pub async fn delete_category(&self, category_id: i64) -> CherthalaResult<u64> {
        let query = TableQuery::from(tables::CATEGORIES).eq("category_id", category_id);
        let removed = self.delete_where(query).await?;
        self.invalidate(keys::CATEGORIES);
        Ok(removed)
    }

    // ------------------------------------------------------------------------
    // Locations
    // ------------------------------------------------------------------------

    /// Locations, newest first, with category and contributor names.
    pub async fn list_locations(&self) -> QueryOutcome<Vec<Location>> {
        self.cached_list(keys::LOCATIONS, Self::locations_query()).await
    }

    fn locations_query() -> TableQuery {
        TableQuery::from(tables::LOCATIONS)
            .select(LOCATION_COLUMNS)
            .order("date_added", false)
    }

    /// Add a location attributed to the signed-in user.
    pub async fn add_location(&self, form: &NewLocation) -> CherthalaResult<Location> {
        let user_id = self.current_user()?;
        form.validate()?;
        let created = self.insert_one(tables::LOCATIONS, form.to_row(user_id)).await?;
        self.invalidate(keys::LOCATIONS);
        Ok(created)
    }

    pub async fn delete_location(&self, location_id: i64) -> CherthalaResult<u64> {
        let query = TableQuery::from(tables::LOCATIONS).eq("location_id", location_id);
        let removed = self.delete_where(query).await?;
        self.invalidate(keys::LOCATIONS);
        Ok(removed)
    }

    /// Categories and members for the location form, fetched together.
    pub async fn location_options(&self) -> CherthalaResult<LocationFormOptions> {
        let categories = TableQuery::from(tables::CATEGORIES).select("category_id, category_name");
        let users = TableQuery::from(tables::USERS).select("id, full_name");
        let (categories, users) = futures_util::try_join!(
            self.select_rows(&categories),
            self.select_rows(&users),
        )?;
        Ok(LocationFormOptions {
            categories: options(&categories, "category_id", "category_name"),
            users: options(&users, "id", "full_name"),
        })
    }

    // ------------------------------------------------------------------------
    // Reviews
    // ------------------------------------------------------------------------

    /// Reviews, newest first, with location and reviewer names.
    pub async fn list_reviews(&self) -> QueryOutcome<Vec<Review>> {
        self.cached_list(keys::REVIEWS, Self::reviews_query()).await
    }

    fn reviews_query() -> TableQuery {
        TableQuery::from(tables::REVIEWS)
            .select(REVIEW_COLUMNS)
            .order("review_date", false)
    }

    /// Add a review written by the signed-in user.
    pub async fn add_review(&self, form: &NewReview) -> CherthalaResult<Review> {
        let user_id = self.current_user()?;
        form.validate()?;
        let created = self.insert_one(tables::REVIEWS, form.to_row(user_id)).await?;
        self.invalidate(keys::REVIEWS);
        Ok(created)
    }

    pub async fn delete_review(&self, review_id: i64) -> CherthalaResult<u64> {
        let query = TableQuery::from(tables::REVIEWS).eq("review_id", review_id);
        let removed = self.delete_where(query).await?;
        self.invalidate(keys::REVIEWS);
        Ok(removed)
    }

    /// Locations and members for the review form, fetched together.
    pub async fn reviewer_options(&self) -> CherthalaResult<ReviewFormOptions> {
        let locations = TableQuery::from(tables::LOCATIONS).select("location_id, location_name");
        let users = TableQuery::from(tables::USERS).select("id, full_name");
        let (locations, users) = futures_util::try_join!(
            self.select_rows(&locations),
            self.select_rows(&users),
        )?;
        Ok(ReviewFormOptions {
            locations: options(&locations, "location_id", "location_name"),
            users: options(&users, "id", "full_name"),
        })
    }

    // ------------------------------------------------------------------------
    // Live handles
    // ------------------------------------------------------------------------

    /// Cached handle over the location list, sharing this directory's cache.
    pub fn locations_handle(&self) -> QueryHandle<Vec<Location>> {
        self.list_handle(keys::LOCATIONS, Self::locations_query())
    }

    /// Cached handle over the review list, sharing this directory's cache.
    pub fn reviews_handle(&self) -> QueryHandle<Vec<Review>> {
        self.list_handle(keys::REVIEWS, Self::reviews_query())
    }

    fn list_handle<T>(&self, key: &str, query: TableQuery) -> QueryHandle<Vec<T>>
    where
        T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let tables = Arc::clone(&self.tables);
        let fetch = fetcher(move || {
            let tables = Arc::clone(&tables);
            let query = query.clone();
            async move {
                let rows = tables.select(&query).await?;
                rows.into_iter()
                    .map(serde_json::from_value)
                    .collect::<Result<Vec<T>, _>>()
                    .map_err(|err| cherthala_core::BackendError::with_code("decode", err.to_string()))
            }
        });
        let options = FetchOptions {
            enabled: true,
            timeout: self.config.query.timeout,
            cache_time: self.config.cache.ttl,
        };
        QueryHandle::new(self.cache.clone(), key, fetch, options)
    }

    // ------------------------------------------------------------------------
    // Home
    // ------------------------------------------------------------------------

    /// Recent locations, newest five-star reviews and table counts in one
    /// batch. Failed parts come back empty or zero with their message in
    /// `errors`; only a complete overview is cached.
    pub async fn home_overview(&self) -> HomeOverview {
        if let Some(read) = self
            .cache
            .get_fresh(keys::HOME, self.config.cache.ttl)
            .and_then(|entry| entry.decode::<HomeOverview>().ok())
        {
            return read.into_value();
        }

        let recent = TableQuery::from(tables::LOCATIONS)
            .select(RECENT_LOCATION_COLUMNS)
            .order("date_added", false)
            .limit(RECENT_LOCATIONS);
        let top = TableQuery::from(tables::REVIEWS)
            .select(TOP_REVIEW_COLUMNS)
            .eq("rating", 5)
            .order("review_date", false)
            .limit(TOP_REVIEWS);

        let queries: Vec<BatchQuery<'_, Value>> = vec![
            self.tables.select(&recent).map(|r| r.map(Value::Array)).boxed(),
            self.tables.select(&top).map(|r| r.map(Value::Array)).boxed(),
            self.tables.count(tables::LOCATIONS).map(|r| r.map(Value::from)).boxed(),
            self.tables.count(tables::REVIEWS).map(|r| r.map(Value::from)).boxed(),
            self.tables.count(tables::USERS).map(|r| r.map(Value::from)).boxed(),
            self.tables.count(tables::CATEGORIES).map(|r| r.map(Value::from)).boxed(),
        ];
        let results = batch_queries(queries, self.config.batch.timeout).await;
        let report = BatchReport::from_results(&results);

        let mut errors = report.messages();
        let mut parts = results.into_iter().map(Result::ok);
        let mut next = || parts.next().flatten();

        let recent_locations = decode_part::<Vec<Location>>(next(), &mut errors);
        let top_reviews = decode_part::<Vec<Review>>(next(), &mut errors);
        let stats = SiteStats {
            total_locations: count_part(next()),
            total_reviews: count_part(next()),
            total_users: count_part(next()),
            total_categories: count_part(next()),
        };
        errors.dedup();

        let overview = HomeOverview {
            recent_locations: recent_locations.unwrap_or_default(),
            top_reviews: top_reviews.unwrap_or_default(),
            stats,
            errors,
        };
        if overview.errors.is_empty() {
            if let Err(err) = self.cache.set_as(keys::HOME, &overview) {
                tracing::warn!(error = %err, "Failed to cache home overview");
            }
        } else {
            tracing::warn!(failed = report.failures.len(), "Home overview degraded");
        }
        overview
    }

    // ------------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------------

    async fn select_rows(&self, query: &TableQuery) -> CherthalaResult<Vec<Value>> {
        with_deadline(&query.table, self.config.query.timeout, self.tables.select(query)).await
    }

    /// Fresh cache hit, or fetch with deadline and retry and store.
    ///
    /// A cache hit reports zero attempts. When every attempt fails the last
    /// cached list for `key` comes back as `data`, however old.
    async fn cached_list<T>(&self, key: &str, query: TableQuery) -> QueryOutcome<Vec<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        if let Some(entry) = self.cache.get_fresh(key, self.config.cache.ttl) {
            match entry.decode::<Vec<T>>() {
                Ok(read) => return QueryOutcome::success(Some(read.into_value()), 0),
                Err(err) => tracing::warn!(key, error = %err, "Ignoring undecodable cache entry"),
            }
        }

        let options = QueryOptions::from_config(key, &self.config.query);
        let mut outcome = optimized_query(|| self.fetch_list::<T>(&query), options).await;
        if outcome.is_ok() {
            if let Some(items) = &outcome.data {
                if let Err(err) = self.cache.set_as(key, items) {
                    tracing::warn!(key, error = %err, "Failed to cache list");
                }
            }
        } else if outcome.data.is_none() {
            outcome.data = self.cache.get_as::<Vec<T>>(key).map(|read| read.into_value());
            if outcome.data.is_some() {
                tracing::warn!(key, "Serving stale list after failed fetch");
            }
        }
        outcome
    }

    async fn fetch_list<T: DeserializeOwned>(&self, query: &TableQuery) -> CherthalaResult<Vec<T>> {
        let rows = self.tables.select(query).await?;
        let items = rows
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<T>, _>>()?;
        Ok(items)
    }

    async fn insert_one<T: DeserializeOwned>(&self, table: &str, row: Value) -> CherthalaResult<T> {
        let rows = with_deadline(
            table,
            self.config.query.timeout,
            self.tables.insert(table, vec![row]),
        )
        .await?;
        let row = rows.into_iter().next().ok_or(CherthalaError::NotFound)?;
        Ok(serde_json::from_value(row)?)
    }

    async fn delete_where(&self, query: TableQuery) -> CherthalaResult<u64> {
        with_deadline(&query.table, self.config.query.timeout, self.tables.delete(&query)).await
    }

    fn invalidate(&self, key: &str) {
        self.cache.delete(key);
        self.cache.delete(keys::HOME);
    }
}

fn options(rows: &[Value], id_column: &str, label_column: &str) -> Vec<SelectOption> {
    rows.iter()
        .filter_map(|row| {
            let id = match row.get(id_column)? {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let label = row.get(label_column)?.as_str()?.to_string();
            Some(SelectOption { id, label })
        })
        .collect()
}

fn decode_part<T: DeserializeOwned>(value: Option<Value>, errors: &mut Vec<String>) -> Option<T> {
    let value = value?;
    match serde_json::from_value(value) {
        Ok(decoded) => Some(decoded),
        Err(err) => {
            errors.push(CherthalaError::from(err).user_message());
            None
        }
    }
}

fn count_part(value: Option<Value>) -> u64 {
    value.and_then(|v| v.as_u64()).unwrap_or(0)
}
