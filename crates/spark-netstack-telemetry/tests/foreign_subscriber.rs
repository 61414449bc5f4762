use spark_netstack_telemetry::{Error, install, install_with_directives, is_installed};

#[test]
fn existing_global_subscriber_is_not_replaced() {
    assert!(matches!(
        install_with_directives("spark_netstack=verbose"),
        Err(Error::InvalidFilter(_))
    ));
    tracing::subscriber::set_global_default(tracing::subscriber::NoSubscriber::default())
        .expect("测试进程内首次设置全局订阅器");
    assert!(matches!(install(), Err(Error::SubscriberAlreadySet)));
    assert!(!is_installed());
}
