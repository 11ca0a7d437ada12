use std::ops::{Deref, DerefMut};

use bson::{oid::ObjectId, Document};
use mongodb::{error::ErrorKind, options::FindOptions, results::UpdateResult};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::Error;

pub struct Collection<T>(pub mongodb::Collection<T>);

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Deref for Collection<T> {
    type Target = mongodb::Collection<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for Collection<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<T> From<mongodb::Collection<T>> for Collection<T> {
    fn from(value: mongodb::Collection<T>) -> Self {
        Self(value)
    }
}

impl<T> Collection<T>
where
    T: DeserializeOwned + Send + Sync + Unpin,
{
    pub async fn find_one_by_id(&self, id: ObjectId) -> Result<Option<T>, Error> {
        self.find_one(
            bson::doc! {
                "_id": id,
            },
            None,
        )
        .await
        .map_err(Into::into)
    }

    pub async fn find_all(
        &self,
        filter: impl Into<Option<Document>>,
        options: impl Into<Option<FindOptions>>,
    ) -> Result<Vec<T>, Error> {
        let mut cursor = self.find(filter, options).await?;

        let mut items = vec![];

        while cursor.advance().await? {
            items.push(cursor.deserialize_current()?);
        }

        Ok(items)
    }

    /// Conditional update: the filter must carry the expected prior state so
    /// a lost race shows up as zero modified documents.
    pub async fn update_one_where(
        &self,
        filter: Document,
        update: Document,
    ) -> Result<UpdateResult, Error> {
        self.update_one(filter, update, None).await.map_err(Into::into)
    }

    pub async fn paginate(
        &self,
        filter: Document,
        sort: Document,
        pagination: &Pagination,
    ) -> Result<Paginated<T>, Error> {
        let total = self.count_documents(filter.clone(), None).await?;

        let limit = pagination.limit();
        let options = FindOptions::builder()
            .sort(sort)
            .skip((pagination.page() - 1) * limit as u64)
            .limit(limit)
            .build();

        let items = self.find_all(filter, options).await?;

        Ok(Paginated {
            items,
            total,
            page_count: (total + limit as u64 - 1) / limit as u64,
        })
    }
}

/// Whether a driver error is a unique-index violation (code 11000), the
/// signal the store gives for a duplicate insert racing past an
/// application-level existence check.
pub fn is_duplicate_key_error(err: &mongodb::error::Error) -> bool {
    match *err.kind {
        ErrorKind::Write(mongodb::error::WriteFailure::WriteError(ref e)) => e.code == 11000,
        ErrorKind::Command(ref e) => e.code == 11000,
        ErrorKind::BulkWrite(ref e) => e
            .write_errors
            .as_ref()
            .map(|errors| errors.iter().any(|it| it.code == 11000))
            .unwrap_or(false),
        _ => false,
    }
}

#[derive(Deserialize, Debug, Clone, Copy, Default)]
pub struct Pagination {
    pub page: Option<u64>,
    pub limit: Option<i64>,
}

impl Pagination {
    pub fn page(&self) -> u64 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(10).clamp(1, 100)
    }
}

#[derive(Serialize, Debug)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub total: u64,
    #[serde(rename = "pageCount")]
    pub page_count: u64,
}

impl<T> Paginated<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Paginated<U> {
        Paginated {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page_count: self.page_count,
        }
    }
}
