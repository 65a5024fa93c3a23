use super::*;
use storage::{NewConnection, NewProfile};

async fn setup() -> (ApiContext, UserId, UserId) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = storage
        .create_user(&NewProfile {
            username: "alice",
            ..Default::default()
        })
        .await
        .expect("alice");
    let bob = storage
        .create_user(&NewProfile {
            username: "bob",
            ..Default::default()
        })
        .await
        .expect("bob");
    (ApiContext::new(storage), alice, bob)
}

async fn pending(ctx: &ApiContext, requester_id: UserId, responder_id: UserId) -> ConnectionId {
    ctx.storage
        .create_connection(&NewConnection {
            requester_id,
            responder_id,
            opportunity_id: None,
            request_type: None,
            created_at: Utc::now(),
        })
        .await
        .expect("connection")
}

async fn stored(ctx: &ApiContext, id: ConnectionId) -> StoredConnection {
    ctx.storage
        .load_connection(id)
        .await
        .expect("load")
        .expect("row")
}

#[tokio::test]
async fn share_contact_marks_connection_accepted() {
    let (ctx, alice, bob) = setup().await;
    let id = pending(&ctx, alice, bob).await;

    share_contact(&ctx, id).await.expect("share");

    let row = stored(&ctx, id).await;
    assert_eq!(row.status, "accepted");
    assert_eq!(ConnectionStatus::from_store(&row.status), ConnectionStatus::Active);
}

#[tokio::test]
async fn share_contact_on_missing_connection_is_not_found() {
    let (ctx, _, _) = setup().await;
    let err = share_contact(&ctx, ConnectionId(42))
        .await
        .expect_err("should fail");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn revoke_access_records_revoke_reason() {
    let (ctx, alice, bob) = setup().await;
    let id = pending(&ctx, alice, bob).await;
    share_contact(&ctx, id).await.expect("share");

    revoke_access(&ctx, id).await.expect("revoke");

    let row = stored(&ctx, id).await;
    assert_eq!(row.status, "rejected");
    assert_eq!(row.decline_reason.as_deref(), Some("Access revoked by user"));
}

#[tokio::test]
async fn decline_keeps_reason_verbatim() {
    let (ctx, alice, bob) = setup().await;
    for reason in ["", "  not now  ", "Timing isn't right, maybe Q3"] {
        let id = pending(&ctx, alice, bob).await;
        decline_connection(&ctx, id, reason).await.expect("decline");
        let row = stored(&ctx, id).await;
        assert_eq!(row.status, "rejected");
        assert_eq!(row.decline_reason.as_deref(), Some(reason));
    }
}

#[tokio::test]
async fn reconsider_clears_any_prior_reason() {
    let (ctx, alice, bob) = setup().await;
    for reason in ["", "wrong stage", REVOKED_DECLINE_REASON] {
        let id = pending(&ctx, alice, bob).await;
        decline_connection(&ctx, id, reason).await.expect("decline");

        reconsider_connection(&ctx, id).await.expect("reconsider");

        let row = stored(&ctx, id).await;
        assert_eq!(row.status, "pending");
        assert_eq!(row.decline_reason, None);
    }
}

#[tokio::test]
async fn declined_only_policy_refuses_to_reopen_revoked_connection() {
    let (ctx, alice, bob) = setup().await;
    let ctx = ctx.with_reconsider_policy(ReconsiderPolicy::DeclinedOnly);
    let revoked = pending(&ctx, alice, bob).await;
    revoke_access(&ctx, revoked).await.expect("revoke");

    let err = reconsider_connection(&ctx, revoked)
        .await
        .expect_err("should refuse");
    assert_eq!(err.code, ErrorCode::Forbidden);
    assert_eq!(stored(&ctx, revoked).await.status, "rejected");

    let declined = pending(&ctx, alice, bob).await;
    decline_connection(&ctx, declined, "later")
        .await
        .expect("decline");
    reconsider_connection(&ctx, declined)
        .await
        .expect("ordinary decline reopens");
}

#[tokio::test]
async fn declined_only_reconsider_of_missing_connection_is_not_found() {
    let (ctx, _, _) = setup().await;
    let ctx = ctx.with_reconsider_policy(ReconsiderPolicy::DeclinedOnly);
    let err = reconsider_connection(&ctx, ConnectionId(404))
        .await
        .expect_err("missing");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn declined_only_guard_holds_when_row_is_revoked_after_a_read() {
    let (ctx, alice, bob) = setup().await;
    let ctx = ctx.with_reconsider_policy(ReconsiderPolicy::DeclinedOnly);
    let id = pending(&ctx, alice, bob).await;
    decline_connection(&ctx, id, "later").await.expect("decline");
    let seen = stored(&ctx, id).await;
    assert!(ctx.reconsider_policy.permits(seen.decline_reason.as_deref()));

    revoke_access(&ctx, id).await.expect("revoke");
    let err = reconsider_connection(&ctx, id)
        .await
        .expect_err("revoked in between");
    assert_eq!(err.code, ErrorCode::Forbidden);
    let row = stored(&ctx, id).await;
    assert_eq!(row.status, "rejected");
    assert_eq!(row.decline_reason.as_deref(), Some(REVOKED_DECLINE_REASON));
}

#[tokio::test]
async fn send_questionnaire_does_not_touch_status() {
    let (ctx, alice, bob) = setup().await;
    let id = pending(&ctx, alice, bob).await;
    let questionnaire = ctx
        .storage
        .create_questionnaire(alice, "Screening")
        .await
        .expect("questionnaire");

    let link = send_questionnaire(&ctx, id, questionnaire)
        .await
        .expect("send");
    assert_eq!(link.status, "sent");
    assert_eq!(link.connection_id, id);
    assert_eq!(stored(&ctx, id).await.status, "pending");
}

#[tokio::test]
async fn send_questionnaire_requires_existing_connection() {
    let (ctx, _, _) = setup().await;
    let err = send_questionnaire(&ctx, ConnectionId(9), QuestionnaireId(1))
        .await
        .expect_err("should fail");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn stats_sum_to_connection_count() {
    let (ctx, alice, bob) = setup().await;
    let a = pending(&ctx, alice, bob).await;
    let b = pending(&ctx, bob, alice).await;
    let c = pending(&ctx, alice, bob).await;
    let _still_pending = pending(&ctx, alice, bob).await;
    share_contact(&ctx, a).await.expect("share");
    decline_connection(&ctx, b, "no").await.expect("decline");
    ctx.storage
        .set_raw_status(c, "archived")
        .await
        .expect("raw status");

    let stats = connection_stats(&ctx, alice).await.expect("stats");
    let listed = list_connections(&ctx, alice).await.expect("list");
    assert_eq!(stats.active, 1);
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.declined, 2);
    assert_eq!(stats.active + stats.pending + stats.declined, stats.total);
    assert_eq!(stats.total as usize, listed.len());
}
