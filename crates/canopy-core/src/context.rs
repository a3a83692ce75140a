// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-request context.
//!
//! A [`RequestContext`] travels with every operation. It carries the caller
//! identity, the pagination window and a cancellation token that the store
//! and the outbound clients observe at every suspension point.

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::identity::Principal;

/// Sentinel limit meaning "return everything".
pub const UNLIMITED: i64 = -1;

/// A page/limit window over a list result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    page: i64,
    limit: i64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self::all()
    }
}

impl Pagination {
    /// Validate the raw query values. A missing page defaults to 1, a
    /// missing limit to [`UNLIMITED`].
    pub fn new(page: Option<i64>, limit: Option<i64>) -> Result<Self> {
        let page = page.unwrap_or(1);
        let limit = limit.unwrap_or(UNLIMITED);

        if page < 1 {
            return Err(Error::bad_request(format!(
                "page must be at least 1, got {}",
                page
            )));
        }
        if limit == 0 || limit < UNLIMITED {
            return Err(Error::bad_request(format!(
                "limit must be positive or -1, got {}",
                limit
            )));
        }
        if limit == UNLIMITED && page != 1 {
            return Err(Error::bad_request("page requires a positive limit"));
        }
        Ok(Self { page, limit })
    }

    /// No window at all.
    pub fn all() -> Self {
        Self {
            page: 1,
            limit: UNLIMITED,
        }
    }

    pub fn page(&self) -> i64 {
        self.page
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn is_unlimited(&self) -> bool {
        self.limit == UNLIMITED
    }

    /// `(limit, offset)` for a bounded window, `None` when unlimited.
    pub fn window(&self) -> Option<(i64, i64)> {
        if self.is_unlimited() {
            None
        } else {
            Some((self.limit, (self.page - 1) * self.limit))
        }
    }

    /// Apply the window to an already materialised list.
    pub fn slice<T: Clone>(&self, items: &[T]) -> Vec<T> {
        match self.window() {
            None => items.to_vec(),
            Some((limit, offset)) => items
                .iter()
                .skip(offset as usize)
                .take(limit as usize)
                .cloned()
                .collect(),
        }
    }

    /// Pagination block for a response, absent when unlimited.
    pub fn meta(&self, total_records: i64) -> Option<PageMeta> {
        let (limit, _) = self.window()?;
        let total_pages = if total_records == 0 {
            0
        } else {
            (total_records + limit - 1) / limit
        };
        Some(PageMeta {
            total_records,
            total_pages,
            current_page: self.page,
            next_page: (self.page < total_pages).then_some(self.page + 1),
            prev_page: (self.page > 1).then_some(self.page - 1),
        })
    }
}

/// Pagination block returned alongside list data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageMeta {
    pub total_records: i64,
    pub total_pages: i64,
    pub current_page: i64,
    pub next_page: Option<i64>,
    pub prev_page: Option<i64>,
}

/// Context passed to every core operation.
#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: Uuid,
    principal: Option<Principal>,
    pagination: Pagination,
    cancel: CancellationToken,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

impl RequestContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            principal: None,
            pagination: Pagination::all(),
            cancel,
        }
    }

    /// Context for work not triggered by a caller: ingestion, sweeps,
    /// event handling.
    pub fn background(cancel: &CancellationToken) -> Self {
        Self::new(cancel.child_token())
    }

    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    pub fn with_pagination(mut self, pagination: Pagination) -> Self {
        self.pagination = pagination;
        self
    }

    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn pagination(&self) -> Pagination {
        self.pagination
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail fast when the caller has gone away.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_defaults() {
        let p = Pagination::new(None, None).unwrap();
        assert!(p.is_unlimited());
        assert_eq!(p.window(), None);
        assert_eq!(p.meta(42), None);
    }

    #[test]
    fn test_pagination_rejects_invalid_values() {
        assert!(Pagination::new(Some(0), Some(10)).is_err());
        assert!(Pagination::new(Some(-3), None).is_err());
        assert!(Pagination::new(Some(1), Some(0)).is_err());
        assert!(Pagination::new(Some(1), Some(-2)).is_err());
        assert!(Pagination::new(Some(2), None).is_err());
        assert!(Pagination::new(Some(2), Some(-1)).is_err());
    }

    #[test]
    fn test_pagination_window_and_meta() {
        let p = Pagination::new(Some(2), Some(10)).unwrap();
        assert_eq!(p.window(), Some((10, 10)));

        let meta = p.meta(25).unwrap();
        assert_eq!(meta.total_pages, 3);
        assert_eq!(meta.current_page, 2);
        assert_eq!(meta.next_page, Some(3));
        assert_eq!(meta.prev_page, Some(1));

        let last = Pagination::new(Some(3), Some(10)).unwrap().meta(25).unwrap();
        assert_eq!(last.next_page, None);

        let empty = Pagination::new(Some(1), Some(10)).unwrap().meta(0).unwrap();
        assert_eq!(empty.total_pages, 0);
        assert_eq!(empty.next_page, None);
        assert_eq!(empty.prev_page, None);
    }

    #[test]
    fn test_pagination_slice() {
        let items: Vec<i32> = (1..=7).collect();
        let p = Pagination::new(Some(2), Some(3)).unwrap();
        assert_eq!(p.slice(&items), vec![4, 5, 6]);
        assert_eq!(Pagination::all().slice(&items), items);
        let beyond = Pagination::new(Some(5), Some(3)).unwrap();
        assert!(beyond.slice(&items).is_empty());
    }

    #[test]
    fn test_context_cancellation() {
        let root = CancellationToken::new();
        let ctx = RequestContext::background(&root);
        assert!(ctx.check_cancelled().is_ok());
        root.cancel();
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.check_cancelled(), Err(Error::Cancelled));
    }
}
