#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Result;

    use crate::{
        data_model::{Alloc, Eval, PoolId},
        pools::PoolError,
        queue::QueueError,
        state_store::StateError,
        testing::TestService,
    };

    /// Poll until the given attempt of an eval has an allocation.
    async fn wait_for_attempt(
        test_srv: &TestService,
        pool_id: &PoolId,
        eval: &Eval,
        attempt: u32,
    ) -> Option<Alloc> {
        let mut expected = eval.clone();
        expected.retry = attempt;
        let alloc_id = expected.alloc_id();
        for _ in 0..150 {
            if let Ok(alloc) = test_srv
                .service
                .line_state
                .get_alloc(pool_id, &alloc_id)
                .await
            {
                return Some(alloc);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        None
    }

    #[tokio::test]
    async fn test_submit_place_complete() -> Result<()> {
        let test_srv = TestService::new().await?;
        let manager = &test_srv.service.pool_manager;

        let pool = manager.create_pool(None).await?;
        let worker = manager.register_worker(&pool.id, None, 10, None).await?;

        let eval = manager.submit_eval(&pool.id, 4, None).await?;
        let alloc = wait_for_attempt(&test_srv, &pool.id, &eval, 1)
            .await
            .expect("eval was never placed");
        assert_eq!(alloc.worker_id, worker.id);

        let claimed = test_srv
            .service
            .line_state
            .get_worker(&pool.id, &worker.id)
            .await?;
        assert_eq!(claimed.capacity, 6);

        manager.complete_alloc(&pool.id, &alloc.id).await?;
        let restored = test_srv
            .service
            .line_state
            .get_worker(&pool.id, &worker.id)
            .await?;
        assert_eq!(restored.capacity, 10);
        Ok(())
    }

    #[tokio::test]
    async fn test_eval_waits_for_capacity() -> Result<()> {
        let test_srv = TestService::new().await?;
        let manager = &test_srv.service.pool_manager;

        let pool = manager.create_pool(None).await?;
        manager.register_worker(&pool.id, None, 3, None).await?;

        let first = manager.submit_eval(&pool.id, 2, None).await?;
        let second = manager.submit_eval(&pool.id, 2, None).await?;

        let first_alloc = wait_for_attempt(&test_srv, &pool.id, &first, 1)
            .await
            .expect("first eval was never placed");

        // The second eval doesn't fit until the first releases.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut second_attempt = second.clone();
        second_attempt.retry = 1;
        assert!(test_srv
            .service
            .line_state
            .get_alloc(&pool.id, &second_attempt.alloc_id())
            .await
            .is_err());

        manager.complete_alloc(&pool.id, &first_alloc.id).await?;
        wait_for_attempt(&test_srv, &pool.id, &second, 1)
            .await
            .expect("second eval was never placed after capacity freed");
        Ok(())
    }

    #[tokio::test]
    async fn test_expired_lease_is_rescheduled() -> Result<()> {
        let test_srv = TestService::new().await?;
        let manager = &test_srv.service.pool_manager;

        let pool = manager.create_pool(None).await?;
        let worker = manager.register_worker(&pool.id, None, 10, None).await?;

        let eval = manager.submit_eval(&pool.id, 4, None).await?;
        wait_for_attempt(&test_srv, &pool.id, &eval, 1)
            .await
            .expect("eval was never placed");

        // No heartbeats; the lease lapses and the sweep takes it back.
        tokio::time::sleep(Duration::from_secs(2)).await;
        manager
            .heartbeat(&pool.id, &worker.id, &[], &[])
            .await?;
        test_srv.sweep().await;

        let second_attempt = wait_for_attempt(&test_srv, &pool.id, &eval, 2)
            .await
            .expect("eval was never rescheduled");
        assert_eq!(second_attempt.eval.retry, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_exhausted_eval_dead_letters() -> Result<()> {
        let test_srv = TestService::new().await?;
        let manager = &test_srv.service.pool_manager;
        let config = &test_srv.service.config;

        let pool = manager.create_pool(None).await?;
        let worker = manager.register_worker(&pool.id, None, 10, None).await?;

        let eval = manager.submit_eval(&pool.id, 1, None).await?;
        // max_retry is 2 under test config: two lapsed attempts exhaust it.
        for attempt in 1..=2 {
            wait_for_attempt(&test_srv, &pool.id, &eval, attempt)
                .await
                .expect("eval was never placed");
            tokio::time::sleep(Duration::from_secs(2)).await;
            manager.heartbeat(&pool.id, &worker.id, &[], &[]).await?;
            test_srv.sweep().await;
        }

        let messages = test_srv
            .service
            .queues
            .receive(
                &config.dead_letter_queue(),
                10,
                Duration::from_secs(2),
                Duration::from_secs(30),
            )
            .await?;
        assert_eq!(messages.len(), 1);
        let dead: Eval = serde_json::from_str(&messages[0].body)?;
        assert_eq!(dead.id, eval.id);

        // Capacity came back with the final reclamation.
        let restored = test_srv
            .service
            .line_state
            .get_worker(&pool.id, &worker.id)
            .await?;
        assert_eq!(restored.capacity, 10);
        Ok(())
    }

    #[tokio::test]
    async fn test_disband_pool_drains() -> Result<()> {
        let test_srv = TestService::new().await?;
        let manager = &test_srv.service.pool_manager;

        let pool = manager.create_pool(None).await?;
        let worker = manager.register_worker(&pool.id, None, 10, None).await?;

        manager.disband_pool(&pool.id).await?;
        manager.disband_pool(&pool.id).await?;

        assert_eq!(
            manager.fetch_pool(&pool.id).await,
            Err(PoolError::State(StateError::PoolNotExists))
        );
        assert_eq!(
            manager.submit_eval(&pool.id, 1, None).await,
            Err(PoolError::State(StateError::PoolNotExists))
        );

        // The record lingers for the reclaimer, then gets purged along with
        // the surviving worker's record and queue.
        tokio::time::sleep(Duration::from_secs(2)).await;
        test_srv.sweep().await;
        assert_eq!(
            test_srv.service.line_state.get_pool(&pool.id).await,
            Err(StateError::PoolNotExists)
        );
        assert!(test_srv
            .service
            .line_state
            .in_memory_state
            .read()
            .await
            .workers
            .is_empty());
        assert_eq!(
            test_srv
                .service
                .queues
                .send(&worker.queue_url, "x".to_string())
                .await,
            Err(QueueError::NotExists)
        );
        Ok(())
    }
}
