// vim: tw=80
mod selectors;
mod simulate;
mod table;

use super::dmmp;
