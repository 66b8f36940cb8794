mod common;
use ankurah_observable::*;
use anyhow::Result;
use common::*;
use futures::StreamExt;

#[test]
fn absent_values_are_filtered_from_subscriptions() {
    let selection = ObservableOption::<u32>::new(None);
    let mut present = selection.subscribe();
    let mut raw = selection.subscribe_raw();

    for v in [Some(1), Some(2), None, Some(3), None] {
        selection.set(v);
    }

    assert_eq!(drain_ready(&mut present), vec![1, 2, 3]);
    assert_eq!(drain_ready(&mut raw), vec![None, Some(1), Some(2), None, Some(3), None]);
    assert_eq!(selection.get(), None);
}

#[test]
fn absent_values_still_reach_hook_and_mirror() {
    let (record, seen) = recorder::<Option<&'static str>>();
    let selection = Observable::builder(Some("a")).on_change(record).mirror_on(Inline).build_optional();
    let mirror = selection.mirror().unwrap();

    selection.clear();
    assert_eq!(mirror.get(), None);
    assert_eq!(*seen.lock().unwrap(), vec![None]);

    mirror.set(Some("b"));
    assert_eq!(selection.get(), Some("b"));
}

#[tokio::test]
async fn wait_for_a_present_value() -> Result<()> {
    let selection = ObservableOption::<String>::default();
    let waiter = {
        let selection = selection.read();
        tokio::spawn(async move { selection.wait_for(|name: &String| name.starts_with('z').then(|| name.clone())).await })
    };
    tokio::task::yield_now().await;
    selection.set(Some("alpha".into()));
    selection.clear();
    selection.set(Some("zulu".into()));
    assert_eq!(waiter.await?, "zulu");
    Ok(())
}

#[tokio::test]
async fn dropping_filtered_subscription_deregisters() -> Result<()> {
    let selection = ObservableOption::new(Some(1));
    let mut sub = selection.subscribe();
    assert_eq!(sub.next().await, Some(1));
    assert_eq!(selection.subscriber_count(), 1);
    drop(sub);
    assert_eq!(selection.subscriber_count(), 0);
    Ok(())
}
