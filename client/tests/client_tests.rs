// Copyright 2025-2026 Maurice S. Barnum
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! End-to-end item operations against the in-process store.

use bytes::Bytes;
use docstore_client::ErrorKind;
use docstore_client::Item;
use docstore_client::PartitionKey;
use docstore_client::RequestOptions;
use docstore_client::Step;
use docstore_client::routing::hash_partition_key;

mod common;
use common::TestResultExt;
use common::TestStore;

#[test_log::test(tokio::test)]
async fn test_item_lifecycle() -> anyhow::Result<()> {
    let ts = TestStore::start(3)?;
    let container = ts.container();
    let session = ts.client.new_session();

    let item = Item::new("19130", "Sweets", Bytes::from_static(b"{\"description\":\"Fudge, chocolate\"}"));
    let created = trace_err!(container.create_item(&session, item.clone()).await)?;
    assert_eq!(item, created.item);
    assert!(created.request_charge > 0.0);
    assert!(created.session_token.is_some());

    let read = trace_err!(container.read_item(&session, "19130", "Sweets").await)?;
    assert_eq!(item, read.item);
    assert_eq!(created.etag, read.etag);
    let written = created.session_token.ok_or_else(|| anyhow::anyhow!("write had no token"))?;
    let seen = read.session_token.ok_or_else(|| anyhow::anyhow!("read had no token"))?;
    assert_eq!(written.partition, seen.partition);
    assert!(seen.sequence >= written.sequence);
    assert!(container.item_exists(&session, "19130", "Sweets").await?);
    assert!(!container.item_exists(&session, "19130", "Candy").await?);

    let dup = container.create_item(&session, item.clone()).await;
    assert_eq!(ErrorKind::Conflict, dup.unwrap_err().kind());

    let updated = Item::new("19130", "Sweets", Bytes::from_static(b"{\"name\":\"Toffee\"}"));
    let replaced = trace_err!(
        container
            .replace_item_with_options(
                &session,
                updated.clone(),
                &RequestOptions::builder().if_match(read.etag).build()
            )
            .await
    )?;
    assert_ne!(read.etag, replaced.etag);

    // the etag read earlier is stale now
    let stale = container
        .replace_item_with_options(
            &session,
            updated.clone(),
            &RequestOptions::builder().if_match(read.etag).build(),
        )
        .await;
    assert_eq!(ErrorKind::Conflict, stale.unwrap_err().kind());

    trace_err!(container.delete_item(&session, "19130", "Sweets").await)?;
    let gone = container.read_item(&session, "19130", "Sweets").await;
    assert_eq!(ErrorKind::NotFound, gone.unwrap_err().kind());
    let again = container.delete_item(&session, "19130", "Sweets").await;
    assert_eq!(ErrorKind::NotFound, again.unwrap_err().kind());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_upsert_creates_then_replaces() -> anyhow::Result<()> {
    let ts = TestStore::start(2)?;
    let container = ts.container();
    let session = ts.client.new_session();

    let first = container
        .upsert_item(&session, common::number_item("a", "pk", 1))
        .await?;
    let second = container
        .upsert_item(&session, common::number_item("a", "pk", 2))
        .await?;
    assert!(second.etag > first.etag);
    assert_eq!(1, ts.store.item_count(common::CONTAINER)?);

    let read = container.read_item(&session, "a", "pk").await?;
    assert_eq!(Bytes::from_static(b"2"), read.item.body);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_upsert_honours_if_match() -> anyhow::Result<()> {
    let ts = TestStore::start(2)?;
    let container = ts.container();
    let session = ts.client.new_session();

    let first = trace_err!(
        container
            .create_item(&session, common::number_item("21083", "Sweets", 1))
            .await
    )?;
    let if_first = RequestOptions::builder().if_match(first.etag).build();
    let second = trace_err!(
        container
            .upsert_item_with_options(&session, common::number_item("21083", "Sweets", 2), &if_first)
            .await
    )?;
    assert!(second.etag > first.etag);

    // someone else's write got in first
    let stale = container
        .upsert_item_with_options(&session, common::number_item("21083", "Sweets", 3), &if_first)
        .await;
    assert_eq!(ErrorKind::Conflict, stale.unwrap_err().kind());
    let read = container.read_item(&session, "21083", "Sweets").await?;
    assert_eq!(second.etag, read.etag);
    assert_eq!(Bytes::from_static(b"2"), read.item.body);

    // nothing stored can match an etag
    let missing = container
        .upsert_item_with_options(&session, common::number_item("21084", "Sweets", 4), &if_first)
        .await;
    assert_eq!(ErrorKind::Conflict, missing.unwrap_err().kind());
    assert!(!container.item_exists(&session, "21084", "Sweets").await?);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_resolve_matches_store_layout() -> anyhow::Result<()> {
    let ts = TestStore::start(4)?;
    let container = ts.container();
    let ranges = ts.store.partitions(common::CONTAINER)?;

    for i in 0..64 {
        let pk = PartitionKey::new(format!("key-{i}"));
        let resolved = container.resolve(&pk).await?;
        let hash = u64::from(hash_partition_key(&pk));
        let owner = ranges
            .iter()
            .find(|r| r.contains(hash))
            .ok_or_else(|| anyhow::anyhow!("no owner for {pk}"))?;
        assert_eq!(owner.id, resolved.id);
    }
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_writes_follow_a_split() -> anyhow::Result<()> {
    let ts = TestStore::start(1)?;
    let container = ts.container();
    let session = ts.client.new_session();

    let parent = container.resolve(&PartitionKey::from("pk")).await?.id;
    container
        .create_item(&session, common::number_item("before", "pk", 1))
        .await?;
    let requests = ts.store.partition_map_requests();

    let (low, high) = ts.split(parent)?;
    let created = trace_err!(
        container
            .create_item(&session, common::number_item("after", "pk", 2))
            .await
    )?;
    assert!(ts.store.partition_map_requests() > requests);

    let owner = container.resolve(&PartitionKey::from("pk")).await?.id;
    assert!(owner == low || owner == high);
    assert_eq!(Some(owner), created.session_token.map(|t| t.partition));

    // the session token issued by the parent still satisfies reads on the child
    let read = trace_err!(container.read_item(&session, "before", "pk").await)?;
    assert_eq!("before", read.item.id);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_sessions_track_their_own_writes() -> anyhow::Result<()> {
    let ts = TestStore::start(2)?;
    let container = ts.container();
    let writer = ts.client.new_session();
    let other = ts.client.new_session();

    let rsp = container
        .create_item(&writer, common::number_item("x", "pk", 7))
        .await?;
    let token = rsp.session_token.ok_or_else(|| anyhow::anyhow!("no token"))?;
    assert_eq!(Some(token), writer.token_for(token.partition));
    assert_eq!(None, other.token_for(token.partition));

    other.tracker().merge(writer.tracker());
    assert_eq!(Some(token), other.token_for(token.partition));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_bulk_upload_with_continuation() -> anyhow::Result<()> {
    let ts = TestStore::start(3)?;
    let container = ts.container();
    let session = ts.client.new_session();
    let total_items = 23;

    let uploaded = container
        .drain_with_continuation(&session, |done| {
            let container = container.clone();
            let session = session.clone();
            async move {
                let batch = (total_items - done).min(5);
                for i in done..done + batch {
                    container
                        .create_item(&session, common::number_item(format!("bulk-{i}"), format!("pk-{i}"), 0))
                        .await?;
                }
                Ok(Step {
                    processed: batch,
                    more: done + batch < total_items,
                })
            }
        })
        .await?;
    assert_eq!(total_items, uploaded);
    assert_eq!(total_items, ts.store.item_count(common::CONTAINER)?);
    Ok(())
}
