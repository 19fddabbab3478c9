use std::time::Duration;

use cellar_pipeline::{
    ChannelObserver, OutcomeSummary, Pipeline, PipelineEvent, PipelineHandle, Step, StepError,
};

#[test]
fn test_channel_observer_sees_full_lifecycle() {
    let (observer, rx) = ChannelObserver::channel();
    let handle = PipelineHandle::spawn("lifecycle", move |token| {
        let mut pipeline = Pipeline::new(vec![
            Step::new("first", |ctx| {
                ctx.report_progress(0.5);
                ctx.report_progress(7.0);
                Ok(())
            }),
            Step::new("second", |_| Err(StepError::msg("broken"))),
            Step::new("third", |_| Ok(())),
        ]);
        pipeline.run(&observer, &token).summary()
    })
    .unwrap();

    let summary = handle.join();
    let events: Vec<_> = rx.try_iter().collect();

    assert_eq!(summary, OutcomeSummary::Failed {
        label:   "second".into(),
        message: "broken".into(),
    });
    assert_eq!(events, vec![
        PipelineEvent::StepStarted("first".into()),
        PipelineEvent::Progress {
            label:    "first".into(),
            fraction: 0.5,
        },
        PipelineEvent::Progress {
            label:    "first".into(),
            fraction: 1.0,
        },
        PipelineEvent::StepDone("first".into()),
        PipelineEvent::StepStarted("second".into()),
        PipelineEvent::StepFailed {
            label:   "second".into(),
            message: "broken".into(),
        },
        PipelineEvent::Finished(summary.clone()),
    ]);
}

#[test]
fn test_cancel_from_caller_thread() {
    let (observer, rx) = ChannelObserver::channel();
    let handle = PipelineHandle::spawn("cancellable", move |token| {
        let mut pipeline = Pipeline::new(vec![
            Step::new("wait", |ctx| {
                while !ctx.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Ok(())
            }),
            Step::new("never", |_| Err(StepError::msg("should not run"))),
        ]);
        pipeline.run(&observer, &token).summary()
    })
    .unwrap();

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        PipelineEvent::StepStarted("wait".into())
    );
    handle.cancel();

    assert_eq!(handle.join(), OutcomeSummary::Cancelled {
        label: "never".into()
    });
}
