#[cfg(test)]
mod integration_tests {
    use crate::{
        Admission, AuditError, AuditOptions, AuditQueue, AuditMode, Config, FetchedPage,
        HtmlFetcher, JobStatus, JobStore, Metrics, PageContext, RenderBackend, RenderedPage,
        RenderingPipeline, Analyzer,
    };
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};
    use tokio::sync::Semaphore;
    use tokio::time::sleep;
    use tokio_util::sync::CancellationToken;

    const CONTENT_HTML: &str = "<html><body><article><h1>Plain content page</h1>\
        <p>Enough visible text that the static pass considers this page complete. \
        Nothing here hints at a client-side framework or an empty app shell, so \
        the rendering heuristic stays quiet and the audit finishes in one pass.</p>\
        </article></body></html>";

    const SHELL_HTML: &str = r#"<html><head>
        <script src="/_next/static/chunks/main-7f3b.js"></script></head>
        <body><div id="root"></div></body></html>"#;

    fn page(html: &str) -> FetchedPage {
        FetchedPage {
            html: html.to_string(),
            status: 200,
            final_url: "https://example.com/".to_string(),
            content_type: Some("text/html".to_string()),
            elapsed: Duration::from_millis(5),
        }
    }

    /// Fetcher that records arrival order, then blocks until the test
    /// releases a permit. One permit admits exactly one fetch.
    struct GatedFetcher {
        gate: Arc<Semaphore>,
        started: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl HtmlFetcher for GatedFetcher {
        async fn fetch(
            &self,
            url: &str,
            _options: &AuditOptions,
        ) -> Result<FetchedPage, AuditError> {
            self.started.lock().unwrap().push(url.to_string());
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| AuditError::Internal(e.to_string()))?;
            permit.forget();
            Ok(page(CONTENT_HTML))
        }
    }

    struct StaticFetcher {
        html: &'static str,
    }

    #[async_trait]
    impl HtmlFetcher for StaticFetcher {
        async fn fetch(
            &self,
            _url: &str,
            _options: &AuditOptions,
        ) -> Result<FetchedPage, AuditError> {
            Ok(page(self.html))
        }
    }

    struct SlowFetcher;

    #[async_trait]
    impl HtmlFetcher for SlowFetcher {
        async fn fetch(
            &self,
            _url: &str,
            _options: &AuditOptions,
        ) -> Result<FetchedPage, AuditError> {
            sleep(Duration::from_secs(30)).await;
            Ok(page(CONTENT_HTML))
        }
    }

    struct MockBackend {
        backend_name: &'static str,
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl MockBackend {
        fn ok(name: &'static str) -> (Arc<Self>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let backend = Arc::new(Self {
                backend_name: name,
                calls: calls.clone(),
                fail: false,
            });
            (backend, calls)
        }

        fn failing(name: &'static str) -> (Arc<Self>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let backend = Arc::new(Self {
                backend_name: name,
                calls: calls.clone(),
                fail: true,
            });
            (backend, calls)
        }
    }

    #[async_trait]
    impl RenderBackend for MockBackend {
        fn name(&self) -> &'static str {
            self.backend_name
        }

        async fn render(
            &self,
            _url: &str,
            _options: &AuditOptions,
            _budget: Duration,
            _cancel: &CancellationToken,
        ) -> Result<RenderedPage, AuditError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                Err(AuditError::BackendUnavailable(
                    "simulated backend failure".to_string(),
                ))
            } else {
                Ok(RenderedPage {
                    html: CONTENT_HTML.to_string(),
                    final_url: None,
                    elapsed: Duration::from_millis(5),
                })
            }
        }
    }

    struct StubAnalyzer;

    impl Analyzer for StubAnalyzer {
        fn name(&self) -> &str {
            "stub"
        }

        fn analyze(&self, page: &PageContext<'_>) -> Result<Value, AuditError> {
            Ok(json!({ "score": 1, "rendered": page.rendered }))
        }
    }

    fn test_config(max_concurrent: usize, max_pending: usize) -> Config {
        Config {
            max_concurrent_audits: max_concurrent,
            max_pending_audits: max_pending,
            job_timeout: Duration::from_secs(20),
            static_timeout: Duration::from_secs(10),
            render_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    fn build_queue(config: Config, fetcher: Arc<dyn HtmlFetcher>) -> (AuditQueue, Arc<JobStore>) {
        let store = Arc::new(JobStore::new());
        let pipeline = Arc::new(RenderingPipeline::new(
            config.clone(),
            fetcher,
            vec![Arc::new(StubAnalyzer)],
        ));
        let queue = AuditQueue::new(config, store.clone(), pipeline, Arc::new(Metrics::new()));
        (queue, store)
    }

    async fn wait_until<F: Fn() -> bool>(condition: F, budget_ms: u64) -> bool {
        let deadline = Instant::now() + Duration::from_millis(budget_ms);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn duplicate_submission_within_window_reuses_job() {
        // Scenario A: identical (url, options) twice within a second.
        let (queue, _store) = build_queue(
            test_config(3, 100),
            Arc::new(StaticFetcher {
                html: CONTENT_HTML,
            }),
        );

        let first = queue
            .add_audit("https://example.com", AuditOptions::default())
            .unwrap();
        let second = queue
            .add_audit("https://example.com", AuditOptions::default())
            .unwrap();

        assert!(matches!(first, Admission::Started { .. }));
        assert!(second.is_duplicate());
        assert_eq!(first.job_id(), second.job_id());
    }

    #[tokio::test]
    async fn different_options_do_not_deduplicate() {
        let (queue, _store) = build_queue(
            test_config(3, 100),
            Arc::new(StaticFetcher {
                html: CONTENT_HTML,
            }),
        );

        let first = queue
            .add_audit("https://example.com", AuditOptions::default())
            .unwrap();
        let second = queue
            .add_audit(
                "https://example.com",
                AuditOptions {
                    enable_js: true,
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(!second.is_duplicate());
        assert_ne!(first.job_id(), second.job_id());
    }

    #[tokio::test]
    async fn fourth_submission_queues_behind_three_slots() {
        // Scenario B: 4 distinct URLs against max_concurrent = 3.
        let gate = Arc::new(Semaphore::new(0));
        let started = Arc::new(Mutex::new(Vec::new()));
        let (queue, store) = build_queue(
            test_config(3, 100),
            Arc::new(GatedFetcher {
                gate: gate.clone(),
                started: started.clone(),
            }),
        );

        let mut admissions = Vec::new();
        for host in ["a", "b", "c", "d"] {
            admissions.push(
                queue
                    .add_audit(&format!("https://{host}.example.com"), AuditOptions::default())
                    .unwrap(),
            );
        }

        assert!(admissions[..3]
            .iter()
            .all(|a| matches!(a, Admission::Started { .. })));
        match &admissions[3] {
            Admission::Queued { position, .. } => assert_eq!(*position, 1),
            other => panic!("expected queued admission, got {other:?}"),
        }

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.processing, 3);
        assert_eq!(snapshot.pending, 1);
        assert_eq!(snapshot.available_slots, 0);

        // Drain everything so the tasks finish.
        gate.add_permits(4);
        let ids: Vec<String> = admissions.iter().map(|a| a.job_id().to_string()).collect();
        let store_ref = store.clone();
        assert!(
            wait_until(
                move || ids
                    .iter()
                    .all(|id| store_ref.get_job(id).map(|(j, _)| j.status.is_terminal()).unwrap_or(false)),
                5000
            )
            .await
        );
    }

    #[tokio::test]
    async fn processing_never_exceeds_concurrency_bound() {
        let gate = Arc::new(Semaphore::new(0));
        let started = Arc::new(Mutex::new(Vec::new()));
        let (queue, store) = build_queue(
            test_config(3, 100),
            Arc::new(GatedFetcher {
                gate: gate.clone(),
                started: started.clone(),
            }),
        );

        let mut ids = Vec::new();
        for i in 0..6 {
            let admission = queue
                .add_audit(&format!("https://host{i}.example.com"), AuditOptions::default())
                .unwrap();
            ids.push(admission.job_id().to_string());
            assert!(queue.snapshot().processing <= 3);
        }

        // Release jobs one at a time; the ceiling must hold at every step.
        for _ in 0..6 {
            assert!(queue.snapshot().processing <= 3);
            gate.add_permits(1);
            sleep(Duration::from_millis(30)).await;
        }

        let store_ref = store.clone();
        let all_terminal = wait_until(
            move || {
                ids.iter().all(|id| {
                    store_ref
                        .get_job(id)
                        .map(|(job, _)| job.status.is_terminal())
                        .unwrap_or(false)
                })
            },
            5000,
        )
        .await;
        assert!(all_terminal, "every submission must reach a terminal state");
        assert_eq!(queue.snapshot().processing, 0);
    }

    #[tokio::test]
    async fn pending_jobs_are_admitted_in_arrival_order() {
        let gate = Arc::new(Semaphore::new(0));
        let started = Arc::new(Mutex::new(Vec::new()));
        let (queue, _store) = build_queue(
            test_config(2, 100),
            Arc::new(GatedFetcher {
                gate: gate.clone(),
                started: started.clone(),
            }),
        );

        let urls: Vec<String> = (1..=5)
            .map(|i| format!("https://site{i}.example.com/"))
            .collect();
        for url in &urls {
            queue.add_audit(url, AuditOptions::default()).unwrap();
        }

        let started_ref = started.clone();
        assert!(wait_until(move || started_ref.lock().unwrap().len() == 2, 2000).await);
        // Job #3 has not begun while both slots are busy.
        assert_eq!(started.lock().unwrap().len(), 2);

        gate.add_permits(1);
        let started_ref = started.clone();
        assert!(wait_until(move || started_ref.lock().unwrap().len() == 3, 2000).await);

        let order = started.lock().unwrap().clone();
        assert_eq!(order[2], urls[2], "FIFO admission must pick job #3 next");

        gate.add_permits(4);
    }

    #[tokio::test]
    async fn full_pending_queue_rejects_with_capacity_error() {
        let gate = Arc::new(Semaphore::new(0));
        let started = Arc::new(Mutex::new(Vec::new()));
        let (queue, _store) = build_queue(
            test_config(1, 1),
            Arc::new(GatedFetcher {
                gate: gate.clone(),
                started: started.clone(),
            }),
        );

        queue
            .add_audit("https://one.example.com", AuditOptions::default())
            .unwrap();
        let second = queue
            .add_audit("https://two.example.com", AuditOptions::default())
            .unwrap();
        assert!(matches!(second, Admission::Queued { position: 1, .. }));

        let rejected = queue.add_audit("https://three.example.com", AuditOptions::default());
        assert!(matches!(rejected, Err(AuditError::QueueFull { .. })));

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.processing, 1);
        assert_eq!(snapshot.pending, 1);

        gate.add_permits(2);
    }

    #[tokio::test]
    async fn timed_out_job_fails_and_frees_its_slot() {
        let config = Config {
            max_concurrent_audits: 1,
            job_timeout: Duration::from_millis(200),
            static_timeout: Duration::from_secs(10),
            render_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let (queue, store) = build_queue(config, Arc::new(SlowFetcher));

        let first = queue
            .add_audit("https://slow-one.example.com", AuditOptions::default())
            .unwrap();
        let second = queue
            .add_audit("https://slow-two.example.com", AuditOptions::default())
            .unwrap();
        assert!(matches!(second, Admission::Queued { .. }));

        let first_id = first.job_id().to_string();
        let store_ref = store.clone();
        assert!(
            wait_until(
                move || store_ref
                    .get_job(&first_id)
                    .map(|(job, _)| job.status == JobStatus::Failed)
                    .unwrap_or(false),
                5000
            )
            .await
        );

        let (job, result) = store.get_job(first.job_id()).unwrap();
        assert_eq!(job.error_code.as_deref(), Some("timeout"));
        assert!(result.is_none());

        // The slot was freed: the queued job is running (or already timed out).
        let second_id = second.job_id().to_string();
        let store_ref = store.clone();
        assert!(
            wait_until(
                move || store_ref
                    .get_job(&second_id)
                    .map(|(job, _)| job.status != JobStatus::Queued)
                    .unwrap_or(false),
                2000
            )
            .await
        );
    }

    fn two_backend_pipeline(
        config: &Config,
        primary: Arc<MockBackend>,
        fallback: Arc<MockBackend>,
    ) -> RenderingPipeline {
        RenderingPipeline::new(
            config.clone(),
            Arc::new(StaticFetcher { html: SHELL_HTML }),
            vec![Arc::new(StubAnalyzer)],
        )
        .with_backend(primary)
        .with_backend(fallback)
    }

    #[tokio::test]
    async fn breaker_trips_after_three_failures_and_skips_primary() {
        // Scenario C: the remote backend fails three times in a row; the
        // fourth render inside the cooldown must go straight to the fallback.
        let config = test_config(3, 100);
        let (primary, primary_calls) = MockBackend::failing("remote");
        let (fallback, fallback_calls) = MockBackend::ok("local");
        let pipeline = two_backend_pipeline(&config, primary, fallback);

        let options = AuditOptions {
            enable_js: true,
            ..Default::default()
        };
        let cancel = CancellationToken::new();

        for _ in 0..3 {
            let report = pipeline
                .run("https://example.com", &options, &cancel)
                .await
                .unwrap();
            assert_eq!(report.js_backend.as_deref(), Some("local"));
        }
        assert_eq!(primary_calls.load(Ordering::Relaxed), 3);
        assert_eq!(fallback_calls.load(Ordering::Relaxed), 3);

        let report = pipeline
            .run("https://example.com", &options, &cancel)
            .await
            .unwrap();

        assert_eq!(
            primary_calls.load(Ordering::Relaxed),
            3,
            "open breaker must short-circuit the primary backend"
        );
        assert_eq!(fallback_calls.load(Ordering::Relaxed), 4);
        assert_eq!(report.js_backend.as_deref(), Some("local"));
        assert_eq!(report.mode, AuditMode::TwoPass);
        assert!(report.phases.javascript.completed);
    }

    #[tokio::test]
    async fn both_backends_down_degrades_to_static() {
        let config = test_config(3, 100);
        let (primary, _) = MockBackend::failing("remote");
        let (fallback, _) = MockBackend::failing("local");
        let pipeline = two_backend_pipeline(&config, primary, fallback);

        let options = AuditOptions {
            enable_js: true,
            ..Default::default()
        };
        let report = pipeline
            .run("https://example.com", &options, &CancellationToken::new())
            .await
            .expect("degraded audit must still complete");

        assert_eq!(report.mode, AuditMode::Static);
        assert!(!report.phases.javascript.completed);
        assert!(report.phases.static_html.completed);
        assert!(report.js_backend.is_none());
    }

    #[tokio::test]
    async fn shell_page_auto_triggers_javascript_phase() {
        let config = test_config(3, 100);
        let (primary, primary_calls) = MockBackend::ok("remote");
        let (fallback, fallback_calls) = MockBackend::ok("local");
        let pipeline = two_backend_pipeline(&config, primary, fallback);

        // enable_js is off; the near-empty shell with bundle markers must
        // trigger the second phase on its own.
        let report = pipeline
            .run(
                "https://example.com",
                &AuditOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.mode, AuditMode::TwoPass);
        assert_eq!(primary_calls.load(Ordering::Relaxed), 1);
        assert_eq!(fallback_calls.load(Ordering::Relaxed), 0);
        assert_eq!(report.js_backend.as_deref(), Some("remote"));
        // Analyzers re-ran against the rendered document.
        assert_eq!(report.scores["stub"]["rendered"], json!(true));
    }

    #[tokio::test]
    async fn content_page_stays_static_without_js_request() {
        let config = test_config(3, 100);
        let (primary, primary_calls) = MockBackend::ok("remote");
        let (fallback, _) = MockBackend::ok("local");
        let pipeline = RenderingPipeline::new(
            config.clone(),
            Arc::new(StaticFetcher {
                html: CONTENT_HTML,
            }),
            vec![Arc::new(StubAnalyzer)],
        )
        .with_backend(primary)
        .with_backend(fallback);

        let report = pipeline
            .run(
                "https://example.com",
                &AuditOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.mode, AuditMode::Static);
        assert_eq!(primary_calls.load(Ordering::Relaxed), 0);
        assert!(report.phases.static_html.completed);
        assert_eq!(report.scores["stub"]["rendered"], json!(false));
    }

    #[tokio::test]
    async fn invalid_url_is_rejected_before_enqueue() {
        let (queue, store) = build_queue(
            test_config(3, 100),
            Arc::new(StaticFetcher {
                html: CONTENT_HTML,
            }),
        );

        let result = queue.add_audit("not a url", AuditOptions::default());
        assert!(matches!(result, Err(AuditError::InvalidUrl(_))));

        let result = queue.add_audit("ftp://example.com", AuditOptions::default());
        assert!(matches!(result, Err(AuditError::InvalidUrl(_))));

        assert_eq!(store.job_count(), 0);
        assert_eq!(queue.snapshot().processing, 0);
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(
            AuditError::InvalidUrl("x".to_string()).error_code(),
            "invalid_url"
        );
        assert_eq!(
            AuditError::QueueFull {
                pending: 1,
                limit: 1
            }
            .error_code(),
            "capacity"
        );
        assert_eq!(
            AuditError::Timeout(Duration::from_secs(1)).error_code(),
            "timeout"
        );
        assert_eq!(
            AuditError::BackendUnavailable("x".to_string()).error_code(),
            "backend_unavailable"
        );
    }

    #[test]
    fn only_first_phase_errors_are_fatal() {
        assert!(AuditError::FetchFailed("refused".to_string()).is_fatal());
        assert!(AuditError::Timeout(Duration::from_secs(1)).is_fatal());
        assert!(AuditError::Cancelled.is_fatal());
        assert!(!AuditError::BackendUnavailable("open".to_string()).is_fatal());
        assert!(!AuditError::RenderFailed("boom".to_string()).is_fatal());
    }

    #[tokio::test]
    async fn service_bootstrap_exposes_health_and_poll() {
        use crate::{AuditService, Config, HealthLevel};

        let config = Config {
            enable_local_browser: false,
            ..Default::default()
        };
        let service = AuditService::new(config, Vec::new()).unwrap();

        assert!(matches!(
            service.poll_job("no-such-job"),
            Err(AuditError::JobNotFound(_))
        ));

        let health = service.health_snapshot();
        assert_eq!(health.status, HealthLevel::Healthy);
        assert_eq!(health.queue.processing, 0);
        assert_eq!(health.queue.available_slots, 3);
        assert!(health.memory.monitoring);

        service.shutdown().await;
        assert!(!service.memory_monitor().stats().monitoring);
    }

    #[tokio::test]
    async fn successful_audit_saves_versioned_result() {
        let (queue, store) = build_queue(
            test_config(3, 100),
            Arc::new(StaticFetcher {
                html: CONTENT_HTML,
            }),
        );

        let admission = queue
            .add_audit("https://example.com", AuditOptions::default())
            .unwrap();
        let job_id = admission.job_id().to_string();

        let store_ref = store.clone();
        let id = job_id.clone();
        assert!(
            wait_until(
                move || store_ref
                    .get_job(&id)
                    .map(|(job, _)| job.status == JobStatus::Succeeded)
                    .unwrap_or(false),
                5000
            )
            .await
        );

        let (job, result) = store.get_job(&job_id).unwrap();
        let result = result.expect("succeeded job must have a stored result");
        assert_eq!(result.schema_version, 1);
        assert_eq!(result.job_id, job_id);
        assert_eq!(result.payload.http_status, 200);
        assert!(job.started_at.is_some());
        assert!(job.finished_at.is_some());
    }
}
