use std::cell::RefCell;
use std::rc::Rc;

use dom_mutation::{
    AttrName, Dom, ContextId, MutationError, MutationRecord, ObserveOptions, ObserverId,
    RecordKind,
};

type Log = Rc<RefCell<Vec<(ObserverId, Vec<MutationRecord>)>>>;

fn collecting_observer(dom: &mut Dom, ctx: ContextId) -> (ObserverId, Log) {
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&log);
    let obs = dom
        .new_observer(ctx, move |_, id, records| {
            sink.borrow_mut().push((id, records));
        })
        .expect("observer construction should succeed");
    (obs, log)
}

fn child_list() -> ObserveOptions {
    ObserveOptions {
        child_list: true,
        ..Default::default()
    }
}

#[test]
fn append_delivers_one_child_list_record() {
    let mut dom = Dom::new();
    let ctx = dom.new_context(false);
    let (obs, log) = collecting_observer(&mut dom, ctx);

    let parent = dom.new_element("div");
    let first = dom.new_element("span");
    dom.append_child(parent, first).unwrap();

    dom.observe(obs, parent, &child_list()).unwrap();
    let second = dom.new_element("span");
    dom.append_child(parent, second).unwrap();

    assert!(log.borrow().is_empty(), "no delivery before the checkpoint");
    dom.run_checkpoint();

    let log = log.borrow();
    assert_eq!(log.len(), 1);
    let (id, records) = &log[0];
    assert_eq!(*id, obs);
    assert_eq!(records.len(), 1);
    let rec = &records[0];
    assert_eq!(rec.kind, RecordKind::ChildList);
    assert_eq!(rec.target, Some(parent));
    assert_eq!(rec.added_nodes, vec![second]);
    assert_eq!(rec.previous_sibling, Some(first));
    assert_eq!(rec.next_sibling, None);
}

#[test]
fn insert_before_reports_both_siblings() {
    let mut dom = Dom::new();
    let ctx = dom.new_context(false);
    let (obs, log) = collecting_observer(&mut dom, ctx);

    let parent = dom.new_element("ul");
    let a = dom.new_element("li");
    let c = dom.new_element("li");
    dom.append_child(parent, a).unwrap();
    dom.append_child(parent, c).unwrap();

    dom.observe(obs, parent, &child_list()).unwrap();
    let b = dom.new_element("li");
    dom.insert_before(parent, b, Some(c)).unwrap();
    dom.run_checkpoint();

    let log = log.borrow();
    let rec = &log[0].1[0];
    assert_eq!(rec.added_nodes, vec![b]);
    assert_eq!(rec.previous_sibling, Some(a));
    assert_eq!(rec.next_sibling, Some(c));
}

#[test]
fn removal_reports_pre_removal_siblings() {
    let mut dom = Dom::new();
    let ctx = dom.new_context(false);
    let (obs, log) = collecting_observer(&mut dom, ctx);

    let parent = dom.new_element("ul");
    let a = dom.new_element("li");
    let b = dom.new_element("li");
    let c = dom.new_element("li");
    for n in [a, b, c] {
        dom.append_child(parent, n).unwrap();
    }

    dom.observe(obs, parent, &child_list()).unwrap();
    dom.remove_child(parent, b).unwrap();
    dom.run_checkpoint();

    let log = log.borrow();
    let rec = &log[0].1[0];
    assert_eq!(rec.removed_nodes, vec![b]);
    assert!(rec.added_nodes.is_empty());
    assert_eq!(rec.previous_sibling, Some(a));
    assert_eq!(rec.next_sibling, Some(c));
}

#[test]
fn attribute_records_snapshot_the_old_value_once() {
    let mut dom = Dom::new();
    let ctx = dom.new_context(false);
    let (obs, log) = collecting_observer(&mut dom, ctx);

    let el = dom.new_element("div");
    let class = AttrName::local("class");
    dom.set_attribute(el, &class, "a").unwrap();

    dom.observe(
        obs,
        el,
        &ObserveOptions {
            attribute_old_value: Some(true),
            ..Default::default()
        },
    )
    .unwrap();

    dom.set_attribute(el, &class, "b").unwrap();
    dom.set_attribute(el, &class, "c").unwrap();
    dom.run_checkpoint();

    let log = log.borrow();
    let records = &log[0].1;
    assert_eq!(records.len(), 2, "one record per mutation level");
    assert_eq!(records[0].kind, RecordKind::Attributes);
    assert_eq!(records[0].target, Some(el));
    assert_eq!(records[0].attr_name.as_deref(), Some("class"));
    assert_eq!(records[0].prev_value.as_deref(), Some("a"));
    assert_eq!(records[1].prev_value.as_deref(), Some("b"));
}

#[test]
fn attribute_filter_limits_reported_attributes() {
    let mut dom = Dom::new();
    let ctx = dom.new_context(false);
    let (obs, log) = collecting_observer(&mut dom, ctx);

    let el = dom.new_element("div");
    dom.observe(
        obs,
        el,
        &ObserveOptions {
            attribute_filter: Some(vec!["class".into()]),
            ..Default::default()
        },
    )
    .unwrap();

    dom.set_attribute(el, &AttrName::local("id"), "x").unwrap();
    dom.set_attribute(el, &AttrName::namespaced("urn:ns", "class"), "y")
        .unwrap();
    dom.set_attribute(el, &AttrName::local("class"), "z").unwrap();
    dom.run_checkpoint();

    let log = log.borrow();
    assert_eq!(log.len(), 1);
    let records = &log[0].1;
    assert_eq!(records.len(), 1, "only the allow-listed local name matches");
    assert_eq!(records[0].attr_name.as_deref(), Some("class"));
    assert_eq!(records[0].attr_namespace, None);
}

#[test]
fn character_data_reports_old_text() {
    let mut dom = Dom::new();
    let ctx = dom.new_context(false);
    let (obs, log) = collecting_observer(&mut dom, ctx);

    let parent = dom.new_element("p");
    let text = dom.new_text("before");
    dom.append_child(parent, text).unwrap();

    dom.observe(
        obs,
        parent,
        &ObserveOptions {
            character_data_old_value: Some(true),
            subtree: true,
            ..Default::default()
        },
    )
    .unwrap();

    dom.set_character_data(text, "after").unwrap();
    dom.run_checkpoint();

    let log = log.borrow();
    let rec = &log[0].1[0];
    assert_eq!(rec.kind, RecordKind::CharacterData);
    assert_eq!(rec.target, Some(text));
    assert_eq!(rec.prev_value.as_deref(), Some("before"));
    assert_eq!(dom.forest().text(text), Some("after"));
}

#[test]
fn observers_deliver_in_registration_order() {
    let mut dom = Dom::new();
    let ctx = dom.new_context(false);
    let order: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));

    let parent = dom.new_element("div");
    let mut observers = Vec::new();
    for tag in 0..3u32 {
        let sink = Rc::clone(&order);
        let obs = dom
            .new_observer(ctx, move |_, _, _| sink.borrow_mut().push(tag))
            .unwrap();
        observers.push(obs);
    }
    // Observe in reverse registration order; delivery order must not care.
    for obs in observers.iter().rev() {
        dom.observe(*obs, parent, &child_list()).unwrap();
    }

    let child = dom.new_element("span");
    dom.append_child(parent, child).unwrap();
    dom.run_checkpoint();

    assert_eq!(*order.borrow(), vec![0, 1, 2]);
}

#[test]
fn take_records_drains_and_preempts_delivery() {
    let mut dom = Dom::new();
    let ctx = dom.new_context(false);
    let (obs, log) = collecting_observer(&mut dom, ctx);

    let parent = dom.new_element("div");
    dom.observe(obs, parent, &child_list()).unwrap();
    let child = dom.new_element("span");
    dom.append_child(parent, child).unwrap();

    let taken = dom.take_records(obs);
    assert_eq!(taken.len(), 1);
    assert!(dom.take_records(obs).is_empty());

    dom.run_checkpoint();
    assert!(log.borrow().is_empty(), "nothing left to deliver");
}

#[test]
fn merged_attribute_records_keep_the_first_old_value() {
    let mut dom = Dom::new();
    let ctx = dom.new_context(false);
    let (obs, _log) = collecting_observer(&mut dom, ctx);
    dom.set_merge_attribute_records(obs, true).unwrap();

    let el = dom.new_element("div");
    let class = AttrName::local("class");
    dom.set_attribute(el, &class, "0").unwrap();
    dom.observe(
        obs,
        el,
        &ObserveOptions {
            attribute_old_value: Some(true),
            ..Default::default()
        },
    )
    .unwrap();

    for v in ["1", "2", "3"] {
        dom.set_attribute(el, &class, v).unwrap();
    }
    dom.set_attribute(el, &AttrName::local("id"), "x").unwrap();
    dom.set_attribute(el, &class, "4").unwrap();

    let records = dom.take_records(obs);
    assert_eq!(records.len(), 3, "adjacent class records collapse");
    assert_eq!(records[0].attr_name.as_deref(), Some("class"));
    assert_eq!(records[0].prev_value.as_deref(), Some("0"));
    assert_eq!(records[1].attr_name.as_deref(), Some("id"));
    assert_eq!(records[2].attr_name.as_deref(), Some("class"));
    assert_eq!(records[2].prev_value.as_deref(), Some("3"));
}

#[test]
fn disconnect_clears_pending_and_receivers() {
    let mut dom = Dom::new();
    let ctx = dom.new_context(false);
    let (obs, log) = collecting_observer(&mut dom, ctx);

    let parent = dom.new_element("div");
    dom.observe(obs, parent, &child_list()).unwrap();
    let child = dom.new_element("span");
    dom.append_child(parent, child).unwrap();

    dom.disconnect(obs);
    assert!(dom.observing_info(obs).unwrap().is_empty());
    dom.run_checkpoint();
    assert!(log.borrow().is_empty());

    // The observer stays usable after a disconnect.
    dom.observe(obs, parent, &child_list()).unwrap();
    let other = dom.new_element("span");
    dom.append_child(parent, other).unwrap();
    dom.run_checkpoint();
    assert_eq!(log.borrow().len(), 1);
}

#[test]
fn observing_info_round_trips_options() {
    let mut dom = Dom::new();
    let ctx = dom.new_context(false);
    let (obs, _log) = collecting_observer(&mut dom, ctx);

    let a = dom.new_element("a");
    let b = dom.new_element("b");
    dom.observe(
        obs,
        a,
        &ObserveOptions {
            attribute_filter: Some(vec!["href".into(), "rel".into()]),
            subtree: true,
            ..Default::default()
        },
    )
    .unwrap();
    dom.observe(
        obs,
        b,
        &ObserveOptions {
            child_list: true,
            character_data: Some(true),
            ..Default::default()
        },
    )
    .unwrap();

    let info = dom.observing_info(obs).unwrap();
    assert_eq!(info.len(), 2);
    assert_eq!(info[0].node, a);
    assert!(info[0].attributes && info[0].subtree);
    assert_eq!(
        info[0].attribute_filter,
        Some(vec!["href".to_string(), "rel".to_string()])
    );
    assert_eq!(info[1].node, b);
    assert!(info[1].child_list && info[1].character_data);
    assert_eq!(info[1].attribute_filter, None);
}

#[test]
fn observe_validation_and_unknown_targets() {
    let mut dom = Dom::new();
    let ctx = dom.new_context(false);
    let (obs, _log) = collecting_observer(&mut dom, ctx);
    let el = dom.new_element("div");

    assert_eq!(
        dom.observe(obs, el, &ObserveOptions::default()),
        Err(MutationError::NoKindsRequested)
    );
    assert_eq!(
        dom.observe(
            obs,
            el,
            &ObserveOptions {
                child_list: true,
                attributes: Some(false),
                attribute_old_value: Some(true),
                ..Default::default()
            }
        ),
        Err(MutationError::OldValueWithoutAttributes)
    );

    let detached = dom.new_element("x");
    dom.destroy_subtree(detached).unwrap();
    assert_eq!(
        dom.observe(obs, detached, &ObserveOptions { child_list: true, ..Default::default() }),
        Err(MutationError::UnknownNode)
    );
}

#[test]
fn anonymous_content_is_reported_only_to_chrome_observers() {
    let mut dom = Dom::new();
    let web = dom.new_context(false);
    let chrome = dom.new_context(true);
    let (web_obs, web_log) = collecting_observer(&mut dom, web);
    let (chrome_obs, chrome_log) = collecting_observer(&mut dom, chrome);

    let host = dom.new_element("host");
    let anon = dom.new_element("anon");
    dom.append_child(host, anon).unwrap();
    dom.set_native_anonymous(anon, true).unwrap();

    let opts = ObserveOptions {
        child_list: true,
        subtree: true,
        ..Default::default()
    };
    dom.observe(web_obs, host, &opts).unwrap();
    dom.observe(chrome_obs, host, &opts).unwrap();

    let inner = dom.new_element("inner");
    dom.append_child(anon, inner).unwrap();
    dom.run_checkpoint();

    assert!(web_log.borrow().is_empty());
    assert_eq!(chrome_log.borrow().len(), 1);
}

#[test]
fn restricted_nodes_are_never_reported() {
    let mut dom = Dom::new();
    let chrome = dom.new_context(true);
    let (obs, log) = collecting_observer(&mut dom, chrome);

    let host = dom.new_element("host");
    let secret = dom.new_element("secret");
    dom.append_child(host, secret).unwrap();
    dom.set_chrome_only(secret, true).unwrap();

    dom.observe(
        obs,
        host,
        &ObserveOptions {
            child_list: true,
            subtree: true,
            ..Default::default()
        },
    )
    .unwrap();

    let inner = dom.new_element("inner");
    dom.append_child(secret, inner).unwrap();
    dom.run_checkpoint();
    assert!(log.borrow().is_empty());
}
