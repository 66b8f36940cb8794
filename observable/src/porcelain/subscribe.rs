use parking_lot::lock_api::RawMutex;

use crate::{
    observable::{Observable, ReadObservable},
    optional::{ObservableOption, ReadObservableOption},
    stream::Subscription,
};

pub trait Get<T> {
    /// Snapshot of the current value
    fn get(&self) -> T;
    fn with<X>(&self, f: impl FnOnce(&T) -> X) -> X;
}

/// Anything that hands out [`Subscription`]s
pub trait Subscribe {
    type Item;
    fn subscribe(&self) -> Subscription<Self::Item>;
}

macro_rules! impl_porcelain {
    ($ty:ident, $value:ty, $item:ty, $($param:ident),+) => {
        impl<$($param,)+ R> Get<$value> for $ty<$($param,)+ R>
        where
            $($param: Clone + Send + Sync + 'static,)+
            R: RawMutex + Send + Sync + 'static,
        {
            fn get(&self) -> $value { $ty::get(self) }
            fn with<X>(&self, f: impl FnOnce(&$value) -> X) -> X { $ty::with(self, f) }
        }

        impl<$($param,)+ R> Subscribe for $ty<$($param,)+ R>
        where
            $($param: Clone + Send + Sync + 'static,)+
            R: RawMutex + Send + Sync + 'static,
        {
            type Item = $item;
            fn subscribe(&self) -> Subscription<$item> { $ty::subscribe(self) }
        }
    };
}

impl_porcelain!(Observable, T, T, T);
impl_porcelain!(ReadObservable, T, T, T);
impl_porcelain!(ObservableOption, Option<U>, U, U);
impl_porcelain!(ReadObservableOption, Option<U>, U, U);
