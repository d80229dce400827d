//! Typed, bounded, observable value cells.
//!
//! A [`Parameter`] is a cheap, cloneable handle onto a shared value. Every
//! subsystem that cares about the value (UI controls, the image converter,
//! controller bindings, persistence) holds its own clone and either reads it
//! with [`Parameter::get`] or registers an observer with
//! [`Parameter::subscribe`]. The value lives until the last handle is dropped.
//!
//! Writes are clamped into the inclusive bounds given at construction and a
//! write that does not change the value is silently ignored, which keeps a
//! slider and a bound controller from echoing each other forever.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::Result;

/// Semantic type carried by a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Integer,
    Float,
    Boolean,
    Text,
}

/// Value types that can live inside a [`Parameter`].
pub trait ParamValue:
    Clone + PartialEq + PartialOrd + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    const KIND: ValueKind;

    /// Numeric view of the value, used when scaling controller input.
    fn to_f64(&self) -> Option<f64> {
        None
    }

    /// Builds a value from a scaled controller input.
    fn from_f64(_value: f64) -> Option<Self> {
        None
    }

    /// Range a controller may drive when the parameter carries no bounds.
    fn implicit_range() -> Option<(f64, f64)> {
        None
    }

    /// Values that must never be stored (NaN floats).
    fn is_storable(&self) -> bool {
        true
    }
}

/// Marker for value types that support `[min, max]` bounds.
pub trait NumericValue: ParamValue + Copy {}

macro_rules! integer_value {
    ($($ty:ty),*) => {$(
        impl ParamValue for $ty {
            const KIND: ValueKind = ValueKind::Integer;

            fn to_f64(&self) -> Option<f64> {
                Some(*self as f64)
            }

            fn from_f64(value: f64) -> Option<Self> {
                if value.is_nan() {
                    return None;
                }
                Some(value.round() as $ty)
            }
        }

        impl NumericValue for $ty {}
    )*};
}

macro_rules! float_value {
    ($($ty:ty),*) => {$(
        impl ParamValue for $ty {
            const KIND: ValueKind = ValueKind::Float;

            fn to_f64(&self) -> Option<f64> {
                Some(*self as f64)
            }

            fn from_f64(value: f64) -> Option<Self> {
                if value.is_nan() {
                    return None;
                }
                Some(value as $ty)
            }

            fn is_storable(&self) -> bool {
                !self.is_nan()
            }
        }

        impl NumericValue for $ty {}
    )*};
}

integer_value!(i32, i64);
float_value!(f32, f64);

impl ParamValue for bool {
    const KIND: ValueKind = ValueKind::Boolean;

    fn to_f64(&self) -> Option<f64> {
        Some(if *self { 1.0 } else { 0.0 })
    }

    fn from_f64(value: f64) -> Option<Self> {
        if value.is_nan() {
            return None;
        }
        Some(value >= 0.5)
    }

    fn implicit_range() -> Option<(f64, f64)> {
        Some((0.0, 1.0))
    }
}

impl ParamValue for String {
    const KIND: ValueKind = ValueKind::Text;
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Observer<T> {
    id: u64,
    callback: Callback<T>,
}

struct Inner<T> {
    name: String,
    bounds: Option<(T, T)>,
    value: RwLock<T>,
    /// Serialises store-and-notify so observers see writes one at a time and
    /// in the order they were applied. Reentrant so an observer may write the
    /// same parameter again from inside its callback.
    gate: ReentrantMutex<()>,
    observers: Mutex<Vec<Observer<T>>>,
    next_id: AtomicU64,
    /// Bumped on every stored write. A fan-out stops early once a nested
    /// write has superseded the value it is delivering.
    generation: AtomicU64,
}

/// Shared handle onto a named, observable value.
///
/// Observers run synchronously on the writing thread while the parameter's
/// write gate is held. Two parameters whose observers write into each other
/// from different threads can therefore deadlock; route such fan-in through a
/// single parameter instead.
pub struct Parameter<T: ParamValue> {
    inner: Arc<Inner<T>>,
}

impl<T: ParamValue> Clone for Parameter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: ParamValue> Parameter<T> {
    /// Creates an unbounded parameter. Booleans and text use this.
    pub fn new(name: impl Into<String>, value: T) -> Self {
        Self::build(name.into(), value, None)
    }

    fn build(name: String, value: T, bounds: Option<(T, T)>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                bounds,
                value: RwLock::new(value),
                gate: ReentrantMutex::new(()),
                observers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> ValueKind {
        T::KIND
    }

    pub fn bounds(&self) -> Option<(T, T)> {
        self.inner.bounds.clone()
    }

    /// Returns the current value.
    pub fn get(&self) -> T {
        self.inner.value.read().clone()
    }

    /// Clamps `value` into the bounds and stores it. Observers are notified
    /// in registration order only when the stored value actually changed.
    ///
    /// An observer that writes this parameter again triggers a nested
    /// fan-out of the newer value; observers not yet reached by the outer
    /// fan-out then only see the newer value.
    pub fn set(&self, value: T) -> bool {
        if !value.is_storable() {
            return false;
        }
        let value = self.clamp(value);

        let _gate = self.inner.gate.lock();
        {
            let mut current = self.inner.value.write();
            if *current == value {
                return false;
            }
            *current = value.clone();
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;

        let callbacks: Vec<Callback<T>> = self
            .inner
            .observers
            .lock()
            .iter()
            .map(|observer| observer.callback.clone())
            .collect();
        for callback in callbacks {
            if self.inner.generation.load(Ordering::Relaxed) != generation {
                break;
            }
            callback(&value);
        }
        true
    }

    /// Registers a change callback. The callback stays registered until the
    /// returned [`Subscription`] is dropped.
    #[must_use = "dropping the subscription unregisters the observer"]
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.observers.lock().push(Observer {
            id,
            callback: Arc::new(callback),
        });

        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.observers.lock().retain(|observer| observer.id != id);
            }
        })
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.lock().len()
    }

    /// Value only; bounds are fixed at construction and never persisted.
    pub fn serialize(&self) -> Result<Value> {
        Ok(serde_json::to_value(self.get())?)
    }

    /// Restores a persisted value. Out-of-range numbers are clamped rather
    /// than rejected. Returns whether the value changed.
    pub fn deserialize(&self, value: &Value) -> Result<bool> {
        match T::deserialize(value) {
            Ok(parsed) => Ok(self.set(parsed)),
            Err(err) => match value.as_f64().and_then(T::from_f64) {
                Some(parsed) if T::KIND != ValueKind::Boolean => Ok(self.set(parsed)),
                _ => Err(err.into()),
            },
        }
    }

    fn clamp(&self, value: T) -> T {
        match &self.inner.bounds {
            Some((min, _)) if value < *min => min.clone(),
            Some((_, max)) if value > *max => max.clone(),
            _ => value,
        }
    }
}

impl<T: NumericValue> Parameter<T> {
    /// Creates a parameter bounded to the inclusive range `[min, max]`. The
    /// initial value is clamped like any other write.
    pub fn ranged(name: impl Into<String>, value: T, min: T, max: T) -> Self {
        let (min, max) = if max < min { (max, min) } else { (min, max) };
        let value = if value < min {
            min
        } else if value > max {
            max
        } else {
            value
        };
        Self::build(name.into(), value, Some((min, max)))
    }

    pub fn min(&self) -> Option<T> {
        self.inner.bounds.map(|(min, _)| min)
    }

    pub fn max(&self) -> Option<T> {
        self.inner.bounds.map(|(_, max)| max)
    }
}

impl<T: ParamValue> fmt::Debug for Parameter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("name", &self.inner.name)
            .field("value", &*self.inner.value.read())
            .field("bounds", &self.inner.bounds)
            .field("observers", &self.observer_count())
            .finish()
    }
}

/// Guard returned by [`Parameter::subscribe`]. Dropping it removes the
/// observer; it is safe to drop after the parameter itself is gone.
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Explicitly removes the observer.
    pub fn unsubscribe(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}

/// Type-erased view of a parameter, used wherever parameters of different
/// value types are handled together (registry, bindings, persistence).
pub trait ControlTarget: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> ValueKind;
    /// Numeric range a controller may drive, `None` when not bindable.
    fn control_range(&self) -> Option<(f64, f64)>;
    /// Writes a value already scaled into [`ControlTarget::control_range`].
    fn set_scaled(&self, value: f64) -> bool;
    fn value_json(&self) -> Result<Value>;
    fn load_json(&self, value: &Value) -> Result<bool>;
}

impl<T: ParamValue> ControlTarget for Parameter<T> {
    fn name(&self) -> &str {
        Parameter::name(self)
    }

    fn kind(&self) -> ValueKind {
        T::KIND
    }

    fn control_range(&self) -> Option<(f64, f64)> {
        match &self.inner.bounds {
            Some((min, max)) => Some((min.to_f64()?, max.to_f64()?)),
            None => T::implicit_range(),
        }
    }

    fn set_scaled(&self, value: f64) -> bool {
        match T::from_f64(value) {
            Some(value) => self.set(value),
            None => false,
        }
    }

    fn value_json(&self) -> Result<Value> {
        self.serialize()
    }

    fn load_json(&self, value: &Value) -> Result<bool> {
        self.deserialize(value)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicUsize, thread};

    use serde_json::json;

    use super::*;

    fn recorder<T: ParamValue>(param: &Parameter<T>) -> (Arc<Mutex<Vec<T>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = param.subscribe(move |value: &T| sink.lock().push(value.clone()));
        (seen, sub)
    }

    #[test]
    fn clamps_writes_into_bounds() {
        let gamma = Parameter::ranged("displayGamma", 2.2_f32, 1.5, 3.5);

        assert!(gamma.set(10.0));
        assert_eq!(gamma.get(), 3.5);
        assert!(gamma.set(-4.0));
        assert_eq!(gamma.get(), 1.5);
        assert!(gamma.set(2.0));
        assert_eq!(gamma.get(), 2.0);
    }

    #[test]
    fn clamped_and_raw_writes_agree() {
        for raw in [-100, -1, 0, 7, 50, 51, 1000] {
            let a = Parameter::ranged("a", 0_i32, -50, 50);
            let b = Parameter::ranged("b", 0_i32, -50, 50);
            a.set(raw);
            b.set(raw.clamp(-50, 50));
            assert_eq!(a.get(), b.get());
            assert_eq!(a.get(), raw.clamp(-50, 50));
        }
    }

    #[test]
    fn initial_value_is_clamped() {
        let width = Parameter::ranged("displayWidth", 100_i32, 16, 64);
        assert_eq!(width.get(), 64);
        assert_eq!(width.min(), Some(16));
        assert_eq!(width.max(), Some(64));
    }

    #[test]
    fn unchanged_value_does_not_notify() {
        let fade = Parameter::ranged("crossfade", 0.25_f32, 0.0, 1.0);
        let (seen, _sub) = recorder(&fade);

        assert!(!fade.set(0.25));
        fade.set(2.0);
        assert!(!fade.set(1.0));
        assert!(!fade.set(5.0));

        assert_eq!(*seen.lock(), vec![1.0]);
    }

    #[test]
    fn notifies_in_registration_order() {
        let param = Parameter::new("sending", false);
        let order = Arc::new(Mutex::new(Vec::new()));
        let subs: Vec<Subscription> = (0..3)
            .map(|index| {
                let order = order.clone();
                param.subscribe(move |_| order.lock().push(index))
            })
            .collect();

        param.set(true);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        drop(subs);
    }

    #[test]
    fn dropping_subscription_unregisters_observer() {
        let param = Parameter::new("portName", String::new());
        let (seen, sub) = recorder(&param);
        assert_eq!(param.observer_count(), 1);

        param.set("ttyUSB0".to_string());
        drop(sub);
        assert_eq!(param.observer_count(), 0);
        param.set("ttyUSB1".to_string());

        assert_eq!(*seen.lock(), vec!["ttyUSB0".to_string()]);
    }

    #[test]
    fn explicit_unsubscribe_and_late_drop_are_safe() {
        let param = Parameter::new("flag", false);
        let (_, sub) = recorder(&param);
        sub.unsubscribe();
        assert_eq!(param.observer_count(), 0);

        let (_, orphan) = recorder(&param);
        drop(param);
        drop(orphan);
    }

    #[test]
    fn observer_may_write_back_into_same_parameter() {
        let param = Parameter::ranged("level", 0_i32, 0, 10);
        let handle = param.clone();
        let _sub = param.subscribe(move |value: &i32| {
            if *value % 2 == 1 {
                handle.set(*value + 1);
            }
        });

        param.set(3);
        assert_eq!(param.get(), 4);
    }

    #[test]
    fn later_observers_never_see_a_superseded_value() {
        let param = Parameter::ranged("level", 0_i32, 0, 10);
        let handle = param.clone();
        let first_seen = Arc::new(Mutex::new(Vec::new()));
        let _first = {
            let first_seen = first_seen.clone();
            param.subscribe(move |value: &i32| {
                first_seen.lock().push(*value);
                if *value == 3 {
                    handle.set(4);
                }
            })
        };
        let (second_seen, _second) = recorder(&param);

        param.set(3);
        assert_eq!(param.get(), 4);
        assert_eq!(*first_seen.lock(), vec![3, 4]);
        assert_eq!(*second_seen.lock(), vec![4]);
    }

    #[test]
    fn nan_writes_are_ignored() {
        let brightness = Parameter::ranged("displayBrightness", 0.0_f64, -1.0, 1.0);
        let (seen, _sub) = recorder(&brightness);
        assert!(!brightness.set(f64::NAN));
        assert_eq!(brightness.get(), 0.0);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn serialises_value_and_clamps_on_restore() {
        let interval = Parameter::ranged("displayInterval", 50_i32, 20, 100);
        assert_eq!(interval.serialize().unwrap(), json!(50));

        assert!(interval.deserialize(&json!(500)).unwrap());
        assert_eq!(interval.get(), 100);

        assert!(interval.deserialize(&json!(33.6)).unwrap());
        assert_eq!(interval.get(), 34);

        assert!(interval.deserialize(&json!("fast")).is_err());
        assert_eq!(interval.get(), 34);
    }

    #[test]
    fn control_ranges_follow_value_kind() {
        let fade = Parameter::ranged("crossfade", 0.0_f32, 0.0, 1.0);
        let flag = Parameter::new("flipHorizontal", false);
        let text = Parameter::new("portName", String::new());
        let free = Parameter::new("free", 0.0_f32);

        assert_eq!(fade.control_range(), Some((0.0, 1.0)));
        assert_eq!(flag.control_range(), Some((0.0, 1.0)));
        assert_eq!(text.control_range(), None);
        assert_eq!(free.control_range(), None);

        assert!(flag.set_scaled(0.7));
        assert!(flag.get());
        assert!(!text.set_scaled(1.0));
        assert_eq!(ControlTarget::kind(&text), ValueKind::Text);
    }

    #[test]
    fn concurrent_writers_produce_one_notification_per_change() {
        let param = Parameter::ranged("counter", 0_i64, 0, 1_000_000);
        let notifications = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicUsize::new(0));

        let _sub = {
            let notifications = notifications.clone();
            let in_flight = in_flight.clone();
            let overlapped = overlapped.clone();
            param.subscribe(move |_| {
                if in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
                    overlapped.fetch_add(1, Ordering::SeqCst);
                }
                notifications.fetch_add(1, Ordering::SeqCst);
                in_flight.fetch_sub(1, Ordering::SeqCst);
            })
        };

        let changes = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let param = param.clone();
                let changes = changes.clone();
                thread::spawn(move || {
                    for step in 0..500_i64 {
                        if param.set(worker * 1000 + step) {
                            changes.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(
            notifications.load(Ordering::SeqCst),
            changes.load(Ordering::SeqCst)
        );
        assert_eq!(overlapped.load(Ordering::SeqCst), 0);
    }
}
