use crate::{
  acceptor::Acceptor,
  builtin::{FdBuilder, FdNameBuilder, ProxyBuilder, TcpBuilder, UnixBuilder},
  error::{ListenError, ListenResult},
  tls::TlsBuilder,
};
use async_trait::async_trait;
use rustc_hash::FxHashMap as HashMap;
use std::sync::{Arc, OnceLock, RwLock};

/// Keyed (JSON object) form of a listener spec.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Builds an acceptor of one particular type. When dispatched from [`open`],
/// `params` is `None` and `arg` is the spec text after the type tag and colon;
/// when dispatched from [`open_json`], `params` is the whole object and `arg`
/// is empty.
///
/// You only need to care about this if you are extending the spec grammar with
/// your own custom types via [`register_acceptor_type`].
#[async_trait]
pub trait BuildAcceptor: Send + Sync {
  async fn build(&self, params: Option<&Params>, arg: &str) -> ListenResult<Box<dyn Acceptor>>;
}

type Registry = RwLock<HashMap<String, Arc<dyn BuildAcceptor>>>;

static ACCEPTOR_TYPES: OnceLock<Registry> = OnceLock::new();

fn acceptor_types() -> &'static Registry {
  ACCEPTOR_TYPES.get_or_init(|| {
    let mut types: HashMap<String, Arc<dyn BuildAcceptor>> = HashMap::default();
    types.insert("tcp".to_string(), Arc::new(TcpBuilder));
    types.insert("unix".to_string(), Arc::new(UnixBuilder));
    types.insert("fd".to_string(), Arc::new(FdBuilder));
    types.insert("fdname".to_string(), Arc::new(FdNameBuilder));
    types.insert("proxy".to_string(), Arc::new(ProxyBuilder));
    let tls: Arc<dyn BuildAcceptor> = Arc::new(TlsBuilder);
    types.insert("tls".to_string(), tls.clone());
    types.insert("https".to_string(), tls);
    RwLock::new(types)
  })
}

/// Make a custom acceptor type available under `name`.
///
/// Panics if called twice with the same name: registering a duplicate type is
/// a programming error.
pub fn register_acceptor_type(name: &str, builder: Arc<dyn BuildAcceptor>) {
  let mut types = acceptor_types().write().expect("acceptor type registry poisoned");
  if types.contains_key(name) {
    panic!("register_acceptor_type: called twice for {name}");
  }
  types.insert(name.to_string(), builder);
}

async fn open_type(name: &str, params: Option<&Params>, arg: &str) -> ListenResult<Box<dyn Acceptor>> {
  // clone the builder out so concurrent builds never hold the registry lock
  let builder = acceptor_types()
    .read()
    .expect("acceptor type registry poisoned")
    .get(name)
    .cloned();
  let Some(builder) = builder else {
    return Err(ListenError::UnknownType(name.to_string()));
  };
  builder.build(params, arg).await
}

/// Open an acceptor with the given string notation. The spec splits on the
/// first `:` into `TYPE:ARG`; a spec without a colon is a `tcp` argument.
pub async fn open(spec: &str) -> ListenResult<Box<dyn Acceptor>> {
  match spec.split_once(':') {
    Some((name, arg)) => open_type(name, None, arg).await,
    None => open_type("tcp", None, spec).await,
  }
}

/// Open an acceptor with the given keyed (JSON object) notation. The object
/// must carry a string `type` field.
pub async fn open_json(spec: &Params) -> ListenResult<Box<dyn Acceptor>> {
  let Some(name) = spec.get("type").and_then(|v| v.as_str()) else {
    return Err(ListenError::MissingType);
  };
  open_type(name, Some(spec), "").await
}

/// Open all of the listed specs. If any spec fails, every acceptor opened so
/// far is closed and the error surfaces wrapping the offending spec text.
pub async fn open_all(specs: &[String]) -> ListenResult<Vec<Box<dyn Acceptor>>> {
  let mut acceptors = Vec::with_capacity(specs.len());
  for spec in specs {
    match open(spec).await {
      Ok(acceptor) => acceptors.push(acceptor),
      Err(err) => {
        close_all(&acceptors).await;
        return Err(ListenError::Spec {
          spec: spec.clone(),
          source: Box::new(err),
        });
      }
    }
  }
  Ok(acceptors)
}

/// Close every listed acceptor, best effort.
pub async fn close_all(acceptors: &[Box<dyn Acceptor>]) {
  for acceptor in acceptors {
    let _ = acceptor.close().await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::acceptor::ListenerAddr;

  #[tokio::test]
  async fn bare_spec_defaults_to_tcp() {
    let acceptor = open("127.0.0.1:0").await.unwrap();
    assert!(matches!(acceptor.addr(), ListenerAddr::Inet(_)));
    acceptor.close().await.unwrap();
  }

  #[tokio::test]
  async fn unknown_type_is_rejected() {
    let err = open("carrier-pigeon:127.0.0.1:0").await.unwrap_err();
    assert!(matches!(err, ListenError::UnknownType(name) if name == "carrier-pigeon"));
  }

  #[tokio::test]
  async fn open_json_requires_type_field() {
    let err = open_json(&Params::new()).await.unwrap_err();
    assert!(matches!(err, ListenError::MissingType));

    let spec: Params = serde_json::from_str(r#"{"type": "tcp", "port": 0, "address": "127.0.0.1"}"#).unwrap();
    let acceptor = open_json(&spec).await.unwrap();
    assert!(matches!(acceptor.addr(), ListenerAddr::Inet(addr) if addr.ip().is_loopback()));
    acceptor.close().await.unwrap();
  }

  #[tokio::test]
  async fn open_all_is_all_or_nothing() {
    let specs = vec!["tcp:127.0.0.1:0".to_string(), "bogus:whatever".to_string()];
    let err = open_all(&specs).await.unwrap_err();
    match err {
      ListenError::Spec { spec, source } => {
        assert_eq!(spec, "bogus:whatever");
        assert!(matches!(*source, ListenError::UnknownType(_)));
      }
      other => panic!("unexpected error: {other}"),
    }

    let specs = vec!["tcp:127.0.0.1:0".to_string(), "proxy:tcp:127.0.0.1:0".to_string()];
    let acceptors = open_all(&specs).await.unwrap();
    assert_eq!(acceptors.len(), 2);
    close_all(&acceptors).await;
  }
}
