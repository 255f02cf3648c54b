use crate::api::User;

pub trait Session: Send + Sync {
    /// `None` when nobody is logged in
    fn current_user(&self) -> Option<User>;
}

/// Session whose user only changes through `login` and `logout`
#[derive(Debug, Default)]
pub struct StaticSession(parking_lot::RwLock<Option<User>>);

impl StaticSession {
    pub fn new(user: Option<User>) -> StaticSession {
        StaticSession(parking_lot::RwLock::new(user))
    }

    pub fn login(&self, user: User) {
        *self.0.write() = Some(user);
    }

    pub fn logout(&self) {
        *self.0.write() = None;
    }
}

impl Session for StaticSession {
    fn current_user(&self) -> Option<User> {
        self.0.read().clone()
    }
}
